//! TRADESCOUT: multi-exchange signal detection and risk engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod strategy;
pub mod exchange;
pub mod engine;
pub mod advisor;
pub mod storage;
pub mod dashboard;
