//! The agent's data model.

mod context;
pub use self::context::Context;

mod event;
pub use self::event::Event;

mod measurement;
pub use self::measurement::{Dimensions, Measurement};

pub mod payload;

mod sample;
pub use self::sample::{MetricSample, MetricType, MetricTypeError};
