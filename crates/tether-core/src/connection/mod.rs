//! Push-channel connection management
//!
//! One long-lived TCP socket per logical channel, read by one background
//! thread. After connecting, the client writes a single subscribe line; the
//! service then streams newline-delimited JSON batches of change records,
//! which are handed to the owning cache through [`NotificationSink`].
//!
//! Managers are process-wide singletons tracked in an explicit registry:
//! [`ConnectionManager::get_or_create`] returns the existing instance for an
//! already-registered channel, so repeated setup is safe.

use crate::config::SyncConfig;
use crate::discovery::EndpointDiscovery;
use crate::error::{TetherError, TetherResult};
use crate::ready::ReadySignal;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier of a logical push channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The channel name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// When a channel's readiness signal is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOn {
    /// As soon as the socket opens (low-volume channels)
    Open,
    /// Left to the owning cache's first full resolution pass
    /// (identifier-stream channels: "connected" is not "consistent")
    FirstSync,
}

/// Receiver of decoded push batches
pub trait NotificationSink: Send + Sync {
    /// Handle one batch of raw change records
    fn deliver(&self, batch: Vec<Value>);
}

type ErrorCallback = Arc<dyn Fn(&TetherError) + Send + Sync>;
type CloseCallback = Arc<dyn Fn() + Send + Sync>;

struct ChannelInner {
    running: bool,
    stream: Option<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

/// Owns one push socket and its reader thread
pub struct ConnectionManager {
    channel: ChannelId,
    ready_on: ReadyOn,
    ready: Arc<ReadySignal>,
    discovery: Arc<EndpointDiscovery>,
    config: SyncConfig,
    sink: Arc<dyn NotificationSink>,
    on_error: ErrorCallback,
    on_close: CloseCallback,
    inner: Mutex<ChannelInner>,
}

/// Process-wide channel registry
static CHANNELS: Lazy<DashMap<ChannelId, Arc<ConnectionManager>>> = Lazy::new(DashMap::new);

impl ConnectionManager {
    /// Create an unregistered manager; callbacks default to log-and-continue
    pub fn new(
        channel: ChannelId,
        ready_on: ReadyOn,
        ready: Arc<ReadySignal>,
        discovery: Arc<EndpointDiscovery>,
        config: SyncConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let channel_name = channel.clone();
        Self {
            channel,
            ready_on,
            ready,
            discovery,
            config,
            sink,
            on_error: Arc::new(move |e| {
                warn!(channel = %channel_name, error = %e, "push channel error");
            }),
            on_close: Arc::new(|| {}),
            inner: Mutex::new(ChannelInner {
                running: false,
                stream: None,
                thread: None,
            }),
        }
    }

    /// Replace the error callback
    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&TetherError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Arc::new(callback);
        self
    }

    /// Replace the close callback, run whenever the socket stops (the cached
    /// endpoint is always invalidated in addition to this)
    pub fn with_close_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Arc::new(callback);
        self
    }

    /// Registry lookup: return the existing manager for this channel or
    /// build, register, and return a new one
    pub fn get_or_create(
        channel: ChannelId,
        build: impl FnOnce() -> Arc<ConnectionManager>,
    ) -> Arc<ConnectionManager> {
        CHANNELS.entry(channel).or_insert_with(build).clone()
    }

    /// The registered manager for a channel, if any
    pub fn lookup(channel: &ChannelId) -> Option<Arc<ConnectionManager>> {
        CHANNELS.get(channel).map(|entry| entry.clone())
    }

    /// Remove a channel from the registry, returning its manager
    ///
    /// The manager keeps working; it just stops being the singleton for its
    /// channel name.
    pub fn unregister(channel: &ChannelId) -> Option<Arc<ConnectionManager>> {
        CHANNELS.remove(channel).map(|(_, manager)| manager)
    }

    /// Cycle every registered channel (service address changed at runtime)
    pub fn reconnect_all() {
        for entry in CHANNELS.iter() {
            if let Err(e) = entry.value().reconnect() {
                warn!(channel = %entry.key(), error = %e, "reconnect failed");
            }
        }
    }

    /// This manager's channel id
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// The readiness signal shared with the owning cache
    pub fn ready_signal(&self) -> &Arc<ReadySignal> {
        &self.ready
    }

    /// Whether the reader thread is currently running
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Open the socket and spawn the reader thread; idempotent if running
    pub fn start(self: &Arc<Self>) -> TetherResult<()> {
        // Reap a reader that exited on its own (socket error or remote
        // close) so repeated start/stop cycles never accumulate threads.
        let stale = {
            let mut inner = self.inner.lock();
            if inner.running {
                return Ok(());
            }
            inner.thread.take()
        };
        if let Some(handle) = stale {
            let _ = handle.join();
        }

        let endpoint = self.discovery.endpoint()?;
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| TetherError::connection(format!("cannot resolve {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| {
                TetherError::connection(format!("no address for endpoint {}", endpoint))
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(|e| {
                // Stale endpoint is the common cause; rediscover next time.
                self.discovery.invalidate();
                TetherError::connection(format!("cannot connect to {}: {}", endpoint, e))
            })?;

        let subscribe = serde_json::json!({ "subscribe": self.channel.as_str() });
        let mut writer = stream.try_clone()?;
        writer.write_all(format!("{}\n", subscribe).as_bytes())?;
        writer.flush()?;

        let reader_stream = stream.try_clone()?;
        {
            let mut inner = self.inner.lock();
            if inner.running {
                return Ok(());
            }
            let this = Arc::clone(self);
            let thread_name = format!("tether-{}-reader", self.channel.as_str().replace('/', "-"));
            match std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || this.read_loop(reader_stream))
            {
                Ok(handle) => {
                    inner.running = true;
                    inner.stream = Some(stream);
                    inner.thread = Some(handle);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.ready_on == ReadyOn::Open {
            self.ready.set();
        }
        info!(channel = %self.channel, endpoint = %endpoint, "push channel connected");
        Ok(())
    }

    /// Stop the socket and join the reader thread; idempotent
    ///
    /// Must not be called from the reader thread's own callbacks.
    pub fn close(&self) {
        let (stream, thread) = {
            let mut inner = self.inner.lock();
            inner.running = false;
            (inner.stream.take(), inner.thread.take())
        };
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = thread {
            let _ = handle.join();
        }
        self.ready.clear();
        debug!(channel = %self.channel, "push channel closed");
    }

    /// `close()` followed by `start()`
    pub fn reconnect(self: &Arc<Self>) -> TetherResult<()> {
        self.close();
        self.start()
    }

    fn read_loop(self: Arc<Self>, stream: TcpStream) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    if self.inner.lock().running {
                        (self.on_error)(&TetherError::from(e));
                    }
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Array(batch)) => self.sink.deliver(batch),
                Ok(record @ Value::Object(_)) => {
                    // Some channels wrap the batch; others push bare
                    // records one per line.
                    match record.get("changes").and_then(Value::as_array) {
                        Some(changes) => self.sink.deliver(changes.clone()),
                        None => self.sink.deliver(vec![record]),
                    }
                }
                Ok(other) => {
                    (self.on_error)(&TetherError::MalformedNotification(format!(
                        "unexpected frame: {}",
                        other
                    )));
                }
                Err(e) => {
                    (self.on_error)(&TetherError::MalformedNotification(e.to_string()));
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.running = false;
            inner.stream = None;
        }
        // The service may come back somewhere else; forget where it was.
        self.discovery.invalidate();
        self.ready.clear();
        (self.on_close)();
        debug!(channel = %self.channel, "reader thread exited");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("channel", &self.channel)
            .field("ready_on", &self.ready_on)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CollectingSink {
        batches: Mutex<Vec<Vec<Value>>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }

        fn wait_for_batches(&self, n: usize) -> Vec<Vec<Value>> {
            for _ in 0..200 {
                if self.batches.lock().len() >= n {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            self.batches.lock().clone()
        }
    }

    impl NotificationSink for CollectingSink {
        fn deliver(&self, batch: Vec<Value>) {
            self.batches.lock().push(batch);
        }
    }

    /// A one-connection-at-a-time push server writing the given lines
    fn push_server(lines: Vec<String>) -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = listener.try_clone().unwrap();
        std::thread::spawn(move || {
            for stream in server.incoming() {
                let Ok(mut stream) = stream else { break };
                // Consume the subscribe line before pushing.
                let mut subscribe = String::new();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let _ = reader.read_line(&mut subscribe);
                for line in &lines {
                    let _ = stream.write_all(line.as_bytes());
                    let _ = stream.write_all(b"\n");
                }
                let _ = stream.flush();
                // Keep the socket open until the client closes it.
                let mut rest = String::new();
                let _ = reader.read_line(&mut rest);
            }
        });
        (listener, addr)
    }

    fn manager_for(
        name: &str,
        addr: std::net::SocketAddr,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<ConnectionManager> {
        let config = SyncConfig::fast().with_endpoint(addr.to_string());
        let discovery = Arc::new(EndpointDiscovery::from_config(&config).unwrap());
        Arc::new(ConnectionManager::new(
            ChannelId::new(name),
            ReadyOn::Open,
            Arc::new(ReadySignal::new()),
            discovery,
            config,
            sink,
        ))
    }

    #[test]
    fn test_batches_reach_the_sink() {
        let (_listener, addr) = push_server(vec![
            r#"[{"id":"a1","tombstoned":false},{"id":"a2","tombstoned":true}]"#.to_string(),
            r#"{"id":"a3"}"#.to_string(),
            r#"{"changes":[{"id":"a4"}]}"#.to_string(),
        ]);
        let sink = CollectingSink::new();
        let manager = manager_for("test/batches", addr, sink.clone());

        manager.start().unwrap();
        let batches = sink.wait_for_batches(3);
        manager.close();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1][0]["id"], "a3");
        assert_eq!(batches[2][0]["id"], "a4");
    }

    #[test]
    fn test_malformed_frames_invoke_error_callback_and_continue() {
        let (_listener, addr) = push_server(vec![
            "not json at all".to_string(),
            "42".to_string(),
            r#"[{"id":"ok"}]"#.to_string(),
        ]);
        let sink = CollectingSink::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_seen = Arc::clone(&errors);

        let config = SyncConfig::fast().with_endpoint(addr.to_string());
        let discovery = Arc::new(EndpointDiscovery::from_config(&config).unwrap());
        let manager = Arc::new(
            ConnectionManager::new(
                ChannelId::new("test/malformed"),
                ReadyOn::Open,
                Arc::new(ReadySignal::new()),
                discovery,
                config,
                sink.clone(),
            )
            .with_error_callback(move |_| {
                errors_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.start().unwrap();
        let batches = sink.wait_for_batches(1);
        manager.close();

        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0]["id"], "ok");
    }

    #[test]
    fn test_ready_on_open_and_cleared_on_close() {
        let (_listener, addr) = push_server(vec![]);
        let sink = CollectingSink::new();
        let manager = manager_for("test/ready", addr, sink);

        assert!(!manager.ready_signal().is_set());
        manager.start().unwrap();
        assert!(manager.ready_signal().is_set());
        manager.close();
        assert!(!manager.ready_signal().is_set());
    }

    #[test]
    fn test_start_is_idempotent_and_close_is_idempotent() {
        let (_listener, addr) = push_server(vec![]);
        let sink = CollectingSink::new();
        let manager = manager_for("test/idempotent", addr, sink);

        manager.start().unwrap();
        manager.start().unwrap();
        assert!(manager.is_running());
        manager.close();
        manager.close();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_close_callback_runs_on_disconnect() {
        let (_listener, addr) = push_server(vec![]);
        let closes = Arc::new(AtomicUsize::new(0));
        let closes_seen = Arc::clone(&closes);

        let config = SyncConfig::fast().with_endpoint(addr.to_string());
        let discovery = Arc::new(EndpointDiscovery::from_config(&config).unwrap());
        let manager = Arc::new(
            ConnectionManager::new(
                ChannelId::new("test/close-callback"),
                ReadyOn::FirstSync,
                Arc::new(ReadySignal::new()),
                discovery,
                config,
                CollectingSink::new(),
            )
            .with_close_callback(move || {
                closes_seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.start().unwrap();
        manager.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_failure_is_recoverable_error() {
        let sink = CollectingSink::new();
        // Port 1 is reserved and closed.
        let config = SyncConfig::fast().with_endpoint("127.0.0.1:1");
        let discovery = Arc::new(EndpointDiscovery::from_config(&config).unwrap());
        let manager = Arc::new(ConnectionManager::new(
            ChannelId::new("test/unreachable"),
            ReadyOn::Open,
            Arc::new(ReadySignal::new()),
            discovery,
            config,
            sink,
        ));

        let err = manager.start().unwrap_err();
        assert!(err.is_retryable());
        assert!(!manager.is_running());
        assert!(!manager.ready_signal().is_set());
    }

    #[test]
    fn test_registry_returns_existing_instance() {
        let (_listener, addr) = push_server(vec![]);
        let channel = ChannelId::new("test/singleton");
        let sink = CollectingSink::new();

        let first = {
            let manager = manager_for("test/singleton", addr, sink.clone());
            ConnectionManager::get_or_create(channel.clone(), || manager)
        };
        let second = ConnectionManager::get_or_create(channel.clone(), || {
            panic!("builder must not run for an existing channel")
        });

        assert!(Arc::ptr_eq(&first, &second));
        ConnectionManager::unregister(&channel);
        assert!(ConnectionManager::lookup(&channel).is_none());
    }
}
