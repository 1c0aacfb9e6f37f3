//! Agent components.
//!
//! This crate contains the agent's three engines: metric aggregation, periodic check collection, and measurement
//! delivery.

#![deny(missing_docs)]

pub mod aggregate;
pub mod collector;
pub mod forwarder;
