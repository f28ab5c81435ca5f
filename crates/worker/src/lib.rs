//! VidBill background worker
//!
//! Runs the monthly billing job on a cron schedule.

pub mod billing_runner;
pub mod config;

pub use billing_runner::BillingRunner;
pub use config::{LogFormat, WorkerConfig};
