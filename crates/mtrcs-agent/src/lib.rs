//! The mtrcs agent: polls collectors into a local [`MemStorage`] and reports
//! the accumulated state to the collector server through a bounded worker
//! pool.
//!
//! [`MemStorage`]: mtrcs_storage::MemStorage

pub mod config;
pub mod dispatcher;
pub mod poller;
pub mod transport;
