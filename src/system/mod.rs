//! Host system queries
//!
//! Hardware facts the inference engine derives its defaults from.

pub mod resources;

pub use resources::{default_thread_count, hardware_concurrency};
