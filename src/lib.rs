pub mod config;
pub mod connection;
pub mod error;
pub mod harness;
pub mod pool;
pub mod report;
pub mod sched;
