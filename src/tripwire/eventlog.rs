//! TL-015: Append-only JSONL provenance event log.

use crate::core::error::Result;
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 UTC timestamp.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path within the state directory.
pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

/// Where provenance events go. Disabled logs drop every event.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self {
            path: Some(event_log_path(state_dir)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event. Write failures are logged, never fatal.
    pub fn record(&self, event: ProvenanceEvent) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_event(path, event) {
            tracing::warn!(path = %path.display(), error = %e, "cannot append provenance event");
        }
    }
}

/// Append an event to the log at `path`.
pub fn append_event(path: &Path, event: ProvenanceEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tl015_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_tl015_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 2 + 12);
    }

    #[test]
    fn test_tl015_event_log_path() {
        let p = event_log_path(Path::new("/state"));
        assert_eq!(p, PathBuf::from("/state/events.jsonl"));
    }

    #[test]
    fn test_tl015_append_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = event_log_path(dir.path());
        let event = ProvenanceEvent::RunStarted {
            run_id: "r-abc".to_string(),
            nodes: 10,
            waves: 5,
            trustlink_version: "0.3.0".to_string(),
        };
        append_event(&path, event).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("run_started"));
        assert!(content.contains("r-abc"));
    }

    #[test]
    fn test_tl015_append_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::in_state_dir(dir.path());
        for i in 0..3 {
            log.record(ProvenanceEvent::NodeConverged {
                run_id: "r-1".to_string(),
                resource: format!("r{}", i),
                action: "CREATE".to_string(),
                duration_seconds: 1.0,
                hash: "blake3:xxx".to_string(),
            });
        }
        let content = std::fs::read_to_string(event_log_path(dir.path())).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_tl015_disabled_log_writes_nothing() {
        let log = EventLog::disabled();
        assert!(log.path().is_none());
        log.record(ProvenanceEvent::NodeSkipped {
            run_id: "r-1".to_string(),
            resource: "x".to_string(),
            reason: "y".to_string(),
        });
    }
}
