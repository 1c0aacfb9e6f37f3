//! Core types shared by the agent's aggregation, forwarding, and collection components.

pub mod data_model;
pub mod observability;
pub mod time;
