//! Process bootstrap helpers shared by agent binaries.

pub mod logging;

/// Common imports for binaries.
pub mod prelude {
    pub use crate::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
