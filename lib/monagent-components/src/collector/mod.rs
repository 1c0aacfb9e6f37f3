//! Periodic collection.
//!
//! A [`Collector`] owns a set of [`Check`]s and runs them on a fixed period, isolating each check's failures from the
//! rest. The measurements they produce, along with anything flushed from a shared aggregator and the collector's own
//! timings, are batched into transactions for the forwarder.
mod check;
pub use self::check::Check;

mod config;
pub use self::config::CollectorConfiguration;

mod driver;
pub use self::driver::{Collector, CollectorState};

mod status;
pub use self::status::{CheckState, CheckStatus, EmitterStatus, StatusHandle, StatusSnapshot};

mod telemetry;
