use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use diamond_snapshot::Snapshot;

use crate::pool::ServerPool;
use crate::transport::{parse_host_list, DiscoveryTransport};

/// Failures that can occur while talking to a discovery endpoint.
#[derive(Debug, Clone)]
pub enum ServerListError {
    HostEmpty { unit: String },
    ResponseError { unit: String, status: Option<u16>, detail: String },
}

impl fmt::Display for ServerListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostEmpty { unit } => write!(f, "discovery returned no hosts for unit {unit}"),
            Self::ResponseError { unit, status, detail } => write!(
                f,
                "discovery request for unit {unit} failed (status={status:?}): {detail}"
            ),
        }
    }
}

impl std::error::Error for ServerListError {}

/// Fire-and-forget events reported while the manager does its work in the
/// background; these never propagate to a caller.
#[derive(Debug, Clone)]
pub enum ServerListEvent {
    UpdateServersFailed { unit: String, error: ServerListError },
    SnapshotJsonParseError { unit: String },
}

impl fmt::Display for ServerListEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateServersFailed { unit, error } => {
                write!(f, "server list refresh failed for unit {unit}: {error}")
            }
            Self::SnapshotJsonParseError { unit } => {
                write!(f, "corrupt server list snapshot for unit {unit}, dropping it")
            }
        }
    }
}

pub type EventSink = Arc<dyn Fn(ServerListEvent) + Send + Sync>;

/// "" is the sentinel cache key for "whichever unit the discovery endpoint
/// considers us to be in" -- it is served by `/diamond-server/diamond`
/// rather than the named `/diamond-server/diamond-unit-<unit>` endpoint.
pub const CURRENT_UNIT: &str = "";

enum ControlMessage {
    Quit,
}

struct Inner {
    endpoint: String,
    transport: Arc<dyn DiscoveryTransport>,
    snapshot: Arc<Snapshot>,
    request_timeout: Duration,
    cache: Mutex<HashMap<String, Option<ServerPool>>>,
    current_unit_name: Mutex<Option<String>>,
    on_error: EventSink,
}

impl Inner {
    fn diamond_url(&self) -> String {
        format!("http://{}/diamond-server/diamond", self.endpoint)
    }

    fn named_unit_url(&self, unit: &str) -> String {
        format!(
            "http://{}/diamond-server/diamond-unit-{unit}?nofix=1",
            self.endpoint
        )
    }

    fn unit_list_url(&self) -> String {
        format!("http://{}/diamond-server/unit-list?nofix=1", self.endpoint)
    }

    fn env_url(&self) -> String {
        format!("http://{}/env", self.endpoint)
    }

    fn report(&self, event: ServerListEvent) {
        tracing::debug!(target: "diamond_server_list", %event, "server list event");
        (self.on_error)(event);
    }

    fn server_list_key(unit: &str) -> String {
        let name = if unit.is_empty() { "current" } else { unit };
        format!("server_list/{name}")
    }

    fn fallback_from_snapshot(&self, unit: &str) -> Option<ServerPool> {
        let key = Self::server_list_key(unit);
        let json = self.snapshot.get(&key)?;
        match serde_json::from_str::<Vec<String>>(&json) {
            Ok(hosts) => ServerPool::new(hosts),
            Err(_) => {
                self.snapshot.delete(&key);
                self.report(ServerListEvent::SnapshotJsonParseError {
                    unit: unit.to_string(),
                });
                None
            }
        }
    }

    /// Fetches the host list for `unit`, falling back to the local snapshot
    /// on any failure, and stores the result (including a `None` miss) in
    /// the cache so the unit stays on the background refresh roster.
    fn refresh_unit(&self, unit: &str) {
        let url = if unit.is_empty() {
            self.diamond_url()
        } else {
            self.named_unit_url(unit)
        };

        let pool = match self.transport.get(&url, self.request_timeout) {
            Ok(resp) if resp.status == 200 => {
                let hosts = parse_host_list(&resp.body);
                if hosts.is_empty() {
                    self.report(ServerListEvent::UpdateServersFailed {
                        unit: unit.to_string(),
                        error: ServerListError::HostEmpty {
                            unit: unit.to_string(),
                        },
                    });
                    self.fallback_from_snapshot(unit)
                } else {
                    if let Ok(json) = serde_json::to_string(&hosts) {
                        self.snapshot
                            .save(&Self::server_list_key(unit), Some(&json));
                    }
                    ServerPool::new(hosts)
                }
            }
            Ok(resp) => {
                self.report(ServerListEvent::UpdateServersFailed {
                    unit: unit.to_string(),
                    error: ServerListError::ResponseError {
                        unit: unit.to_string(),
                        status: Some(resp.status),
                        detail: resp.body,
                    },
                });
                self.fallback_from_snapshot(unit)
            }
            Err(message) => {
                self.report(ServerListEvent::UpdateServersFailed {
                    unit: unit.to_string(),
                    error: ServerListError::ResponseError {
                        unit: unit.to_string(),
                        status: None,
                        detail: message,
                    },
                });
                self.fallback_from_snapshot(unit)
            }
        };

        self.cache.lock().unwrap().insert(unit.to_string(), pool);
    }
}

/// Per-unit server discovery: round-robin selection, background refresh,
/// and snapshot-backed fallback.
pub struct ServerListManager {
    inner: Arc<Inner>,
    control: Mutex<Option<Sender<ControlMessage>>>,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServerListManager {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn DiscoveryTransport>,
        snapshot: Arc<Snapshot>,
        refresh_interval: Duration,
        request_timeout: Duration,
        on_error: EventSink,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            endpoint: endpoint.into(),
            transport,
            snapshot,
            request_timeout,
            cache: Mutex::new(HashMap::new()),
            current_unit_name: Mutex::new(None),
            on_error,
        });

        let (tx, rx) = channel();
        let loop_inner = inner.clone();
        let handle = std::thread::spawn(move || refresh_loop(loop_inner, refresh_interval, rx));

        Arc::new(Self {
            inner,
            control: Mutex::new(Some(tx)),
            refresh_handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the next host for `unit` in round-robin order, fetching the
    /// list synchronously on first access. `None` means discovery failed
    /// and no snapshot was available either.
    pub fn get_one(&self, unit: &str) -> Option<String> {
        {
            let mut cache = self.inner.cache.lock().unwrap();
            if let Some(slot) = cache.get_mut(unit) {
                return slot.as_mut().map(ServerPool::next);
            }
        }
        self.inner.refresh_unit(unit);
        let mut cache = self.inner.cache.lock().unwrap();
        cache.get_mut(unit).and_then(|slot| slot.as_mut().map(ServerPool::next))
    }

    /// Enumerates all unit names known to the discovery endpoint.
    pub fn fetch_unit_lists(&self) -> Result<Vec<String>, ServerListError> {
        let resp = self
            .inner
            .transport
            .get(&self.inner.unit_list_url(), self.inner.request_timeout)
            .map_err(|detail| ServerListError::ResponseError {
                unit: CURRENT_UNIT.to_string(),
                status: None,
                detail,
            })?;
        if resp.status != 200 {
            return Err(ServerListError::ResponseError {
                unit: CURRENT_UNIT.to_string(),
                status: Some(resp.status),
                detail: resp.body,
            });
        }
        Ok(parse_host_list(&resp.body))
    }

    /// Resolves (once per process) which unit this client belongs to.
    pub fn get_current_unit(&self) -> Result<String, ServerListError> {
        if let Some(name) = self.inner.current_unit_name.lock().unwrap().as_ref() {
            return Ok(name.clone());
        }
        let resp = self
            .inner
            .transport
            .get(&self.inner.env_url(), self.inner.request_timeout)
            .map_err(|detail| ServerListError::ResponseError {
                unit: CURRENT_UNIT.to_string(),
                status: None,
                detail,
            })?;
        if resp.status != 200 {
            return Err(ServerListError::ResponseError {
                unit: CURRENT_UNIT.to_string(),
                status: Some(resp.status),
                detail: resp.body,
            });
        }
        let name = resp.body.trim().to_string();
        *self.inner.current_unit_name.lock().unwrap() = Some(name.clone());
        Ok(name)
    }

    /// Stops the background refresh loop. Idempotent.
    pub fn close(&self) {
        if let Some(tx) = self.control.lock().unwrap().take() {
            let _ = tx.send(ControlMessage::Quit);
        }
        if let Some(handle) = self.refresh_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerListManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn refresh_loop(inner: Arc<Inner>, refresh_interval: Duration, rx: std::sync::mpsc::Receiver<ControlMessage>) {
    loop {
        match rx.recv_timeout(refresh_interval) {
            Err(RecvTimeoutError::Disconnected) => return,
            Ok(ControlMessage::Quit) => return,
            Err(RecvTimeoutError::Timeout) => {
                let units: Vec<String> = inner.cache.lock().unwrap().keys().cloned().collect();
                tracing::debug!(target: "diamond_server_list", unit_count = units.len(), "refreshing server lists");
                std::thread::scope(|scope| {
                    for unit in &units {
                        let inner = &inner;
                        scope.spawn(move || inner.refresh_unit(unit));
                    }
                });
            }
        }
    }
}
