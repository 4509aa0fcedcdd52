//! Local filesystem-backed key -> bytes store.
//!
//! Used both as a read-through cache and as a disaster-fallback source when
//! the remote config service cannot be reached. Nothing here is transactional:
//! a write is "durable" the moment the filesystem says so, and failures are
//! reported through a caller-supplied sink rather than ever propagated to the
//! read path (see the `Snapshot` rationale below).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One reported failure. The store never fails its own callers; instead
/// every I/O error surfaces here so a host application can observe it.
#[derive(Debug)]
pub enum SnapshotEvent {
    ReadFailed { key: String, error: SnapshotError },
    WriteFailed { key: String, error: SnapshotError },
    DeleteFailed { key: String, error: SnapshotError },
}

impl fmt::Display for SnapshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { key, error } => write!(f, "snapshot read failed for {key}: {error}"),
            Self::WriteFailed { key, error } => {
                write!(f, "snapshot write failed for {key}: {error}")
            }
            Self::DeleteFailed { key, error } => {
                write!(f, "snapshot delete failed for {key}: {error}")
            }
        }
    }
}

#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Sink that snapshot errors are reported to. Cloned cheaply and shared
/// across every component that touches the store.
pub type EventSink = Arc<dyn Fn(SnapshotEvent) + Send + Sync>;

/// Filesystem-backed key -> bytes store rooted at a configured directory.
///
/// Keys are logical paths (`config/<unit>/<tenant>/<group>/<dataId>`,
/// `server_list/<unit>`); forward slashes in a key are joined with the
/// platform separator under `root`.
pub struct Snapshot {
    root: PathBuf,
    on_error: EventSink,
}

impl Snapshot {
    pub fn new(root: impl Into<PathBuf>, on_error: EventSink) -> Self {
        Self {
            root: root.into(),
            on_error,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }

    fn report(&self, event: SnapshotEvent) {
        tracing::debug!(target: "diamond_snapshot", %event, "snapshot operation failed");
        (self.on_error)(event);
    }

    /// Returns the stored value, or `None` if absent *or* if reading failed.
    /// A read failure is reported via the event sink but never distinguished
    /// from "no snapshot" to the caller.
    pub fn get(&self, key: &str) -> Option<String> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                self.report(SnapshotEvent::ReadFailed {
                    key: key.to_string(),
                    error: e.into(),
                });
                None
            }
        }
    }

    /// Persists `value` under `key`, creating intermediate directories as
    /// needed. `None` is written as an empty file. Failures are reported,
    /// never returned.
    pub fn save(&self, key: &str, value: Option<&str>) {
        if let Err(e) = self.save_inner(key, value) {
            self.report(SnapshotEvent::WriteFailed {
                key: key.to_string(),
                error: e,
            });
        }
    }

    fn save_inner(&self, key: &str, value: Option<&str>) -> Result<(), SnapshotError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, value.unwrap_or(""))?;
        Ok(())
    }

    /// Recursively removes the file backing `key`. Missing files are not an
    /// error. Failures are reported, never returned.
    pub fn delete(&self, key: &str) {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => self.report(SnapshotEvent::DeleteFailed {
                key: key.to_string(),
                error: e.into(),
            }),
        }
    }

    /// Saves every entry concurrently. Each entry's failure is reported
    /// independently; one failing entry does not block the rest.
    pub fn batch_save(&self, entries: &[(String, Option<String>)]) {
        std::thread::scope(|scope| {
            for (key, value) in entries {
                scope.spawn(move || self.save(key, value.as_deref()));
            }
        });
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sink() -> (EventSink, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink = Arc::new(move |e| captured.lock().unwrap().push(e.to_string()));
        (sink, events)
    }

    #[test]
    fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        store.save("config/unit1/default_tenant/DEFAULT_GROUP/app.json", Some("v1"));
        assert_eq!(
            store.get("config/unit1/default_tenant/DEFAULT_GROUP/app.json"),
            Some("v1".to_string())
        );
    }

    #[test]
    fn get_missing_key_returns_none_without_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        assert_eq!(store.get("nope"), None);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        store.save("server_list/unit1", Some("[\"h1\"]"));
        store.delete("server_list/unit1");
        assert_eq!(store.get("server_list/unit1"), None);
    }

    #[test]
    fn delete_missing_key_does_not_report() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        store.delete("never-existed");
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn batch_save_persists_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        let entries: Vec<(String, Option<String>)> = (0..16)
            .map(|i| (format!("config/u/ns/g/id{i}"), Some(format!("v{i}"))))
            .collect();
        store.batch_save(&entries);
        for (key, value) in &entries {
            assert_eq!(store.get(key), value.clone());
        }
    }

    #[test]
    fn save_with_none_writes_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _events) = sink();
        let store = Snapshot::new(dir.path(), sink);
        store.save("config/u/ns/g/id", None);
        assert_eq!(store.get("config/u/ns/g/id"), Some(String::new()));
    }
}
