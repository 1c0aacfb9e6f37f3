//! Measurement delivery.
//!
//! Encoded batches of measurements are wrapped in [`Transaction`]s and queued in a [`TransactionManager`], which
//! delivers them to a [`DeliveryEndpoint`] on a fixed schedule. Delivery failures never surface to producers: failed
//! transactions are retried with exponential backoff until they are delivered, exceed the retry limit, or grow too old,
//! and a full queue makes room by evicting its oldest transactions.
use std::sync::Arc;

use monagent_error::GenericError;
use tracing::warn;

mod backoff;
pub use self::backoff::ExponentialBackoff;

mod config;
pub use self::config::ForwarderConfiguration;

mod endpoint;
pub use self::endpoint::{DeliveryEndpoint, HttpEndpoint, LogEndpoint};

mod manager;
pub use self::manager::{AppendOutcome, FlushStatus, FlushSummary, TransactionManager};

mod telemetry;

mod transaction;
pub use self::transaction::Transaction;

/// Builds the endpoint described by `config`.
///
/// Without a configured URL, batches are logged instead of delivered.
///
/// # Errors
///
/// If the URL is invalid, or the HTTP client cannot be created, an error is returned.
pub fn build_endpoint(config: &ForwarderConfiguration) -> Result<Arc<dyn DeliveryEndpoint>, GenericError> {
    match config.url() {
        Some(url) => {
            let endpoint = HttpEndpoint::new(url, config.auth_token().map(String::from), config.request_timeout())?;
            Ok(Arc::new(endpoint))
        }
        None => {
            warn!("No forwarder URL configured. Measurements will be logged and discarded.");
            Ok(Arc::new(LogEndpoint))
        }
    }
}
