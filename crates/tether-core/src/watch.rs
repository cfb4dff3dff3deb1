//! Service state file watcher
//!
//! Watches the discovery state file so an endpoint change (service restart
//! on a new port) cycles every push channel without waiting for a socket to
//! fail first. Events are debounced; the service rewrites the file in a
//! couple of quick steps on startup.

use crate::connection::ConnectionManager;
use crate::discovery::EndpointDiscovery;
use crate::error::{TetherError, TetherResult};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the service state file and cycles connections on change
pub struct EndpointWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl std::fmt::Debug for EndpointWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointWatcher").finish_non_exhaustive()
    }
}

impl EndpointWatcher {
    /// Watch the state file; on change, invalidate the cached endpoint and
    /// reconnect every registered push channel
    pub fn spawn(discovery: Arc<EndpointDiscovery>) -> TetherResult<Self> {
        Self::spawn_with(discovery, ConnectionManager::reconnect_all)
    }

    /// Watch the state file with an explicit reaction, run after the cached
    /// endpoint is invalidated
    pub fn spawn_with(
        discovery: Arc<EndpointDiscovery>,
        on_change: impl Fn() + Send + Sync + 'static,
    ) -> TetherResult<Self> {
        let state_file = discovery.state_file().to_path_buf();
        // Watch the parent directory: editors and the service itself tend to
        // replace the file rather than write it in place.
        let watch_dir = state_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    if events.iter().any(|e| e.path == state_file) {
                        info!(path = %state_file.display(), "service state file changed");
                        discovery.invalidate();
                        on_change();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "state file watch error");
                }
            },
        )
        .map_err(|e| TetherError::discovery(format!("cannot create file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                TetherError::discovery(format!(
                    "cannot watch {}: {}",
                    watch_dir.display(),
                    e
                ))
            })?;
        info!(dir = %watch_dir.display(), "watching service state directory");

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_is_discovery_error() {
        let discovery = Arc::new(EndpointDiscovery::with_path(
            "/nonexistent/tether/service.json",
        ));
        let err = EndpointWatcher::spawn_with(discovery, || {}).unwrap_err();
        assert!(matches!(err, TetherError::Discovery(_)));
    }

    #[test]
    fn test_state_file_change_invalidates_and_fires() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, r#"{"port": 7000}"#).unwrap();

        let discovery = Arc::new(EndpointDiscovery::with_path(&path));
        assert_eq!(discovery.endpoint().unwrap().port, 7000);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_seen = Arc::clone(&fired);
        let _watcher =
            EndpointWatcher::spawn_with(Arc::clone(&discovery), move || {
                fired_seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        std::fs::write(&path, r#"{"port": 7001}"#).unwrap();

        // Debounced at 500ms; leave generous headroom.
        for _ in 0..400 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        assert!(fired.load(Ordering::SeqCst) > 0);
        // Invalidation happened before the callback, so the next lookup
        // re-reads the file.
        assert_eq!(discovery.endpoint().unwrap().port, 7001);
    }

    #[test]
    fn test_sibling_file_changes_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, r#"{"port": 7000}"#).unwrap();

        let discovery = Arc::new(EndpointDiscovery::with_path(&path));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_seen = Arc::clone(&fired);
        let _watcher =
            EndpointWatcher::spawn_with(Arc::clone(&discovery), move || {
                fired_seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        std::fs::write(dir.path().join("other.log"), "noise").unwrap();
        std::thread::sleep(Duration::from_millis(900));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
