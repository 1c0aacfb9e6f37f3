use std::{path::Path, sync::Arc};

use arc_swap::ArcSwap;
use monagent_error::{ErrorContext as _, GenericError};
use serde::Serialize;

/// Outcome of a single check in the most recent run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum CheckState {
    /// The check ran successfully.
    Ok,

    /// The check failed, panicked, or timed out.
    Failed(String),
}

/// Per-check status.
#[derive(Clone, Debug, Serialize)]
pub struct CheckStatus {
    /// Name of the check.
    pub name: String,

    /// Whether the run succeeded.
    #[serde(flatten)]
    pub state: CheckState,

    /// Number of measurements the check returned.
    pub metrics: usize,

    /// Number of events the check returned.
    pub events: usize,

    /// Wall-clock time the run took, in seconds.
    pub duration_secs: f64,
}

/// Per-emitter status.
#[derive(Clone, Debug, Serialize)]
pub struct EmitterStatus {
    /// Name of the emitter, currently always `forwarder`.
    pub name: String,

    /// Number of measurements handed to the forwarder.
    pub measurements: usize,

    /// Number of transactions the measurements were batched into.
    pub transactions: usize,

    /// Number of queued transactions evicted to make room for this run's batches.
    pub evicted: usize,

    /// Number of measurements dropped because their value was not finite or their batch could not be encoded.
    pub dropped: usize,
}

/// What the collector did in its most recent run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusSnapshot {
    /// Number of completed runs.
    pub run_count: u64,

    /// Unix timestamp at which the run finished, in seconds.
    pub timestamp: u64,

    /// Time spent running checks and flushing the aggregator, in seconds.
    pub collection_time: f64,

    /// Time spent handing the run's measurements to the forwarder, in seconds.
    pub emit_time: f64,

    /// Status of every check that ran, in registration order.
    pub check_statuses: Vec<CheckStatus>,

    /// Status of every emitter the run's measurements were handed to.
    pub emitter_statuses: Vec<EmitterStatus>,
}

impl StatusSnapshot {
    /// Returns the status of the check named `name`, if it ran.
    pub fn check(&self, name: &str) -> Option<&CheckStatus> {
        self.check_statuses.iter().find(|status| status.name == name)
    }
}

/// A cheap, cloneable reader of the collector's latest status.
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<StatusSnapshot>>,
}

impl StatusHandle {
    /// Returns the latest snapshot.
    pub fn load(&self) -> Arc<StatusSnapshot> {
        self.inner.load_full()
    }

    pub(super) fn store(&self, snapshot: StatusSnapshot) -> Arc<StatusSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.inner.store(Arc::clone(&snapshot));
        snapshot
    }
}

/// Writes `snapshot` to `path` as JSON, replacing the previous file atomically.
pub(super) async fn write_status_file(path: &Path, snapshot: &StatusSnapshot) -> Result<(), GenericError> {
    let serialized = serde_json::to_vec_pretty(snapshot).error_context("Failed to serialize status snapshot.")?;

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");

    tokio::fs::write(&tmp_path, &serialized)
        .await
        .with_error_context(|| format!("Failed to write status file '{}'.", Path::new(&tmp_path).display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_error_context(|| format!("Failed to move status file into place at '{}'.", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn check_state_serialization() {
        let status = CheckStatus {
            name: "disk".to_string(),
            state: CheckState::Failed("permission denied".to_string()),
            metrics: 0,
            events: 0,
            duration_secs: 0.5,
        };

        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "name": "disk",
                "state": "failed",
                "error": "permission denied",
                "metrics": 0,
                "events": 0,
                "duration_secs": 0.5,
            })
        );
    }

    #[tokio::test]
    async fn status_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let mut snapshot = StatusSnapshot {
            run_count: 1,
            ..Default::default()
        };
        write_status_file(&path, &snapshot).await.unwrap();

        snapshot.run_count = 2;
        write_status_file(&path, &snapshot).await.unwrap();

        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["run_count"], 2);
        assert!(!dir.path().join("status.json.tmp").exists());
    }
}
