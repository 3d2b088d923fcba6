//! Integration tests: the full detection cycle against in-memory venues.

mod advisory;
mod detection_cycle;
mod mock_exchange;
