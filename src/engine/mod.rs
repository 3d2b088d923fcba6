//! Core engine: scan → fuse → size → validate → rank, guarded by the
//! safety monitor and driven by the detection loop.

pub mod detection;
pub mod fusion;
pub mod metrics;
pub mod ranker;
pub mod risk;
pub mod safety;
pub mod scanner;
