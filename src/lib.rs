//! Synchronized performance polling for storage controller couplets.
//!
//! A [`supervisor::Supervisor`] runs one [`worker::Worker`] process per
//! controller and wakes them all on a shared clock. Each worker samples
//! cumulative counters into [`series::RateSeries`], turns them into rates
//! over a trailing window and hands the results to a [`storage::Storage`]
//! sink, every point stamped with the cycle's shared epoch.

pub mod config;
pub mod error;
pub mod hardware;
pub mod hosts;
pub mod scheduler;
pub mod series;
pub mod storage;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
