//! Per-unit client: the signed request layer, the read/write operations,
//! and the subscription / long-polling engine (spec §4.3-4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;

use diamond_server_list::ServerListManager;
use diamond_snapshot::Snapshot;

use crate::config::Config;
use crate::constants::{
    DEFAULT_PLAIN_PORT, DEFAULT_TENANT_KEY_SEGMENT, DEFAULT_TLS_PORT, LINE_SEP,
    LONG_POLL_ERROR_BACKOFF, LONG_POLL_SERVER_TIMEOUT_MS, LONG_POLL_TRANSPORT_TIMEOUT, WORD_SEP,
};
use crate::error::{DiamondError, DiamondEvent, EventSink};
use crate::sign;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};

/// A registered change callback. Identity (`Arc::ptr_eq`) is how a specific
/// listener is found again for targeted unsubscribe.
pub type Listener = Arc<dyn Fn(&str) + Send + Sync>;

struct Subscription {
    data_id: String,
    group: String,
    md5: Option<String>,
    content: Option<String>,
    listeners: Vec<Listener>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    status: i32,
    #[serde(rename = "dataId")]
    data_id: String,
    group: String,
    #[serde(default)]
    content: Option<String>,
}

/// One row of `getAllConfigInfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigItem {
    #[serde(rename = "dataId")]
    pub data_id: String,
    pub group: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListAllPage {
    #[serde(rename = "totalCount")]
    total_count: u64,
    #[serde(rename = "pageItems")]
    page_items: Vec<ConfigItem>,
}

enum ControlMessage {
    Quit,
}

enum DispatchMessage {
    Emit(Vec<Listener>, String),
    Quit,
}

/// One client bound to a single unit, sharing the server list manager and
/// snapshot store with every other unit under the same façade.
pub struct UnitClient {
    unit: String,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    server_list: Arc<ServerListManager>,
    snapshot: Arc<Snapshot>,
    on_error: EventSink,

    current_host: Mutex<Option<String>>,
    subscriptions: Mutex<HashMap<(String, String), Subscription>>,
    long_poll_running: Mutex<bool>,
    long_poll_control: Mutex<Option<Sender<ControlMessage>>>,
    long_poll_handle: Mutex<Option<JoinHandle<()>>>,
    dispatch_tx: Sender<DispatchMessage>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UnitClient {
    pub fn new(
        unit: impl Into<String>,
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        server_list: Arc<ServerListManager>,
        snapshot: Arc<Snapshot>,
        on_error: EventSink,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = channel();
        let dispatch_handle = std::thread::spawn(move || dispatch_loop(dispatch_rx));

        Arc::new(Self {
            unit: unit.into(),
            config,
            transport,
            server_list,
            snapshot,
            on_error,
            current_host: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            long_poll_running: Mutex::new(false),
            long_poll_control: Mutex::new(None),
            long_poll_handle: Mutex::new(None),
            dispatch_tx,
            dispatch_handle: Mutex::new(Some(dispatch_handle)),
            closed: AtomicBool::new(false),
        })
    }

    fn report(&self, event: DiamondEvent) {
        tracing::debug!(target: "diamond_client::unit_client", %event, "unit client event");
        (self.on_error)(event);
    }

    fn tenant(&self) -> &str {
        &self.config.namespace
    }

    fn tenant_key_segment(&self) -> &str {
        let tenant = self.tenant();
        if tenant.is_empty() {
            DEFAULT_TENANT_KEY_SEGMENT
        } else {
            tenant
        }
    }

    fn snapshot_key(&self, data_id: &str, group: &str) -> String {
        format!(
            "config/{}/{}/{group}/{data_id}",
            self.unit,
            self.tenant_key_segment()
        )
    }

    // ---- signed request layer (§4.3) -------------------------------------

    fn reselect_host(&self) -> Result<String, DiamondError> {
        let host = self
            .server_list
            .get_one(&self.unit)
            .ok_or_else(|| DiamondError::ServerUnavailable {
                unit: self.unit.clone(),
            })?;
        *self.current_host.lock().unwrap() = Some(host.clone());
        Ok(host)
    }

    fn ensure_host(&self) -> Result<String, DiamondError> {
        if let Some(host) = self.current_host.lock().unwrap().clone() {
            return Ok(host);
        }
        self.reselect_host()
    }

    fn base_url(&self, host: &str) -> String {
        let scheme = if self.config.ssl { "https" } else { "http" };
        if host.contains(':') {
            format!("{scheme}://{host}/diamond-server")
        } else {
            let port = if self.config.ssl {
                DEFAULT_TLS_PORT
            } else {
                DEFAULT_PLAIN_PORT
            };
            format!("{scheme}://{host}:{port}/diamond-server")
        }
    }

    fn encode_payload(fields: &[(&str, &str)], encode: bool) -> String {
        fields
            .iter()
            .map(|(k, v)| {
                if encode {
                    format!("{k}={}", urlencoding::encode(v))
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Sends one signed request. `None` on a 404 ("no such config"); `Ok`
    /// carries the raw body otherwise. Any non-2xx/404 response re-selects
    /// `current_host` before returning the error, per §4.3.
    #[allow(clippy::too_many_arguments)]
    fn signed_request(
        &self,
        method: Method,
        path: &str,
        group: &str,
        fields: &[(&str, &str)],
        encode: bool,
        extra_headers: &[(&str, &str)],
        timeout_override: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, DiamondError> {
        let host = self.ensure_host()?;
        let payload = Self::encode_payload(fields, encode);

        let (url, body) = match method {
            Method::Get if !payload.is_empty() => {
                (format!("{}{path}?{payload}", self.base_url(&host)), None)
            }
            Method::Get => (format!("{}{path}", self.base_url(&host)), None),
            Method::Post => (format!("{}{path}", self.base_url(&host)), Some(payload)),
        };

        let ts = sign::now_millis();
        let mut headers = sign::auth_headers(
            &self.config.access_key,
            &self.config.secret_key,
            self.tenant(),
            group,
            ts,
        );
        headers.extend(
            extra_headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        let request = HttpRequest {
            method,
            url: url.clone(),
            headers,
            body,
            timeout: timeout_override.unwrap_or(self.config.request_timeout),
        };

        match self.transport.request(request) {
            Ok(HttpResponse { status: 200, body }) => Ok(Some(body)),
            Ok(HttpResponse { status: 404, .. }) => Ok(None),
            Ok(HttpResponse { status: 409, .. }) => Err(DiamondError::ServerConflict { url }),
            Ok(HttpResponse { status, body }) => {
                let _ = self.reselect_host();
                Err(DiamondError::ServerResponse {
                    url,
                    status: Some(status),
                    detail: String::from_utf8_lossy(&body).into_owned(),
                })
            }
            Err(detail) => {
                let _ = self.reselect_host();
                Err(DiamondError::ServerResponse {
                    url,
                    status: None,
                    detail,
                })
            }
        }
    }

    // ---- read/write operations (§4.4) -------------------------------------

    /// `getConfig`: HTTP on success, snapshot on failure. Only propagates an
    /// error when *both* fail.
    pub fn get_config(&self, data_id: &str, group: &str) -> Result<Option<String>, DiamondError> {
        let key = self.snapshot_key(data_id, group);
        let fields = [("dataId", data_id), ("group", group), ("tenant", self.tenant())];
        match self.signed_request(Method::Get, "/config.co", group, &fields, false, &[], None) {
            Ok(Some(body)) => {
                let content = String::from_utf8_lossy(&body).into_owned();
                self.snapshot.save(&key, Some(&content));
                Ok(Some(content))
            }
            Ok(None) => Ok(None),
            Err(e) => match self.snapshot.get(&key) {
                Some(cached) => {
                    self.report(DiamondEvent::from_error(&self.unit, &e));
                    Ok(Some(cached))
                }
                None => Err(e),
            },
        }
    }

    pub fn publish_single(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
    ) -> Result<(), DiamondError> {
        let fields = [
            ("dataId", data_id),
            ("group", group),
            ("content", content),
            ("tenant", self.tenant()),
        ];
        self.signed_request(
            Method::Post,
            "/basestone.do?method=syncUpdateAll",
            group,
            &fields,
            true,
            &[],
            None,
        )?;
        Ok(())
    }

    pub fn remove(&self, data_id: &str, group: &str) -> Result<(), DiamondError> {
        let fields = [("dataId", data_id), ("group", group), ("tenant", self.tenant())];
        self.signed_request(
            Method::Post,
            "/datum.do?method=deleteAllDatums",
            group,
            &fields,
            false,
            &[],
            None,
        )?;
        Ok(())
    }

    pub fn publish_aggr(
        &self,
        data_id: &str,
        group: &str,
        datum_id: &str,
        content: &str,
    ) -> Result<(), DiamondError> {
        let app_name = self.config.app_name.as_deref().unwrap_or("");
        let fields = [
            ("dataId", data_id),
            ("group", group),
            ("datumId", datum_id),
            ("content", content),
            ("appName", app_name),
            ("tenant", self.tenant()),
        ];
        self.signed_request(
            Method::Post,
            "/datum.do?method=addDatum",
            group,
            &fields,
            false,
            &[],
            None,
        )?;
        Ok(())
    }

    pub fn remove_aggr(
        &self,
        data_id: &str,
        group: &str,
        datum_id: &str,
    ) -> Result<(), DiamondError> {
        let fields = [
            ("dataId", data_id),
            ("group", group),
            ("datumId", datum_id),
            ("tenant", self.tenant()),
        ];
        self.signed_request(
            Method::Post,
            "/datum.do?method=deleteDatum",
            group,
            &fields,
            false,
            &[],
            None,
        )?;
        Ok(())
    }

    pub fn batch_get_config(
        &self,
        data_ids: &[String],
        group: &str,
    ) -> Result<Vec<(String, String, i32, Option<String>)>, DiamondError> {
        let joined = data_ids.join(&WORD_SEP.to_string());
        let fields = [("dataIds", joined.as_str()), ("group", group), ("tenant", self.tenant())];
        let body = self
            .signed_request(
                Method::Post,
                "/config.co?method=batchGetConfig",
                group,
                &fields,
                false,
                &[],
                None,
            )?
            .unwrap_or_default();
        let raw = String::from_utf8_lossy(&body).into_owned();
        let entries: Vec<BatchEntry> = serde_json::from_str(&raw)
            .map_err(|_| DiamondError::BatchDeserialize { body: raw.clone() })?;
        for entry in &entries {
            if entry.status == 1 {
                let key = self.snapshot_key(&entry.data_id, &entry.group);
                self.snapshot.save(&key, entry.content.as_deref());
            }
        }
        Ok(entries
            .into_iter()
            .map(|e| (e.data_id, e.group, e.status, e.content))
            .collect())
    }

    pub fn batch_query(&self, data_ids: &[String], group: &str) -> Result<String, DiamondError> {
        let joined = data_ids.join(&WORD_SEP.to_string());
        let fields = [("dataIds", joined.as_str()), ("group", group), ("tenant", self.tenant())];
        let body = self
            .signed_request(
                Method::Post,
                "/admin.do?method=batchQuery",
                group,
                &fields,
                false,
                &[],
                None,
            )?
            .unwrap_or_default();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn list_all_page(&self, page_no: u32, page_size: u32) -> Result<ListAllPage, DiamondError> {
        let page_no_s = page_no.to_string();
        let page_size_s = page_size.to_string();
        let fields = [
            ("pageNo", page_no_s.as_str()),
            ("pageSize", page_size_s.as_str()),
            ("method", "getAllConfigInfoByTenant"),
            ("tenant", self.tenant()),
        ];
        let body = self
            .signed_request(Method::Get, "/basestone.do", "", &fields, false, &[], None)?
            .unwrap_or_default();
        let raw = String::from_utf8_lossy(&body).into_owned();
        serde_json::from_str(&raw).map_err(|_| DiamondError::BatchDeserialize { body: raw })
    }

    /// `getAllConfigInfo`: learns `totalCount` from a 1-row probe, then pages
    /// through the rest at 200 per page, sequentially.
    pub fn get_all_config_info(&self) -> Result<Vec<ConfigItem>, DiamondError> {
        let first = self.list_all_page(1, 1)?;
        let mut items = Vec::with_capacity(first.total_count as usize);
        let page_size = 200u32;
        let total_pages = first.total_count.div_ceil(page_size as u64).max(1);
        for page_no in 1..=total_pages {
            let page = self.list_all_page(page_no as u32, page_size)?;
            items.extend(page.page_items);
        }
        Ok(items)
    }

    // ---- subscription / long-polling engine (§4.5) -------------------------

    /// Registers `listener` for `(data_id, group)`. Triggers an initial sync
    /// the first time this key is seen; otherwise delivers the cached value
    /// (if any) to `listener` alone, deferred to the dispatch thread.
    pub fn subscribe(self: &Arc<Self>, data_id: &str, group: &str, listener: Listener) {
        let key = (data_id.to_string(), group.to_string());
        let mut newly_created = false;
        {
            let mut subs = self.subscriptions.lock().unwrap();
            match subs.get_mut(&key) {
                Some(sub) => {
                    if let Some(content) = sub.md5.as_ref().and(sub.content.clone()) {
                        let _ = self
                            .dispatch_tx
                            .send(DispatchMessage::Emit(vec![listener.clone()], content));
                    }
                    sub.listeners.push(listener);
                }
                None => {
                    subs.insert(
                        key,
                        Subscription {
                            data_id: data_id.to_string(),
                            group: group.to_string(),
                            md5: None,
                            content: None,
                            listeners: vec![listener],
                        },
                    );
                    newly_created = true;
                }
            }
        }
        if newly_created {
            self.ensure_long_poll_started();
        }
    }

    /// Removes `listener` (or every listener when `None`) from `(data_id,
    /// group)`. The long-polling loop drops the subscription on its next
    /// iteration once the listener set is empty.
    pub fn unsubscribe(&self, data_id: &str, group: &str, listener: Option<&Listener>) {
        let key = (data_id.to_string(), group.to_string());
        let mut subs = self.subscriptions.lock().unwrap();
        let Some(sub) = subs.get_mut(&key) else {
            return;
        };
        match listener {
            Some(target) => sub.listeners.retain(|l| !Arc::ptr_eq(l, target)),
            None => sub.listeners.clear(),
        }
        if sub.listeners.is_empty() {
            subs.remove(&key);
        }
    }

    fn ensure_long_poll_started(self: &Arc<Self>) {
        let mut running = self.long_poll_running.lock().unwrap();
        if *running {
            return;
        }
        *running = true;
        let (tx, rx) = channel();
        *self.long_poll_control.lock().unwrap() = Some(tx);
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.long_poll_loop(rx));
        *self.long_poll_handle.lock().unwrap() = Some(handle);
    }

    fn snapshot_subs(&self) -> Vec<(String, String, Option<String>)> {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .map(|s| (s.data_id.clone(), s.group.clone(), s.md5.clone()))
            .collect()
    }

    fn build_probe(&self, subs: &[(String, String, Option<String>)]) -> String {
        let tenant = self.tenant();
        let mut probe = String::new();
        for (data_id, group, md5) in subs {
            let md5 = md5.as_deref().unwrap_or("");
            probe.push_str(data_id);
            probe.push(WORD_SEP);
            probe.push_str(group);
            probe.push(WORD_SEP);
            if !tenant.is_empty() {
                probe.push_str(md5);
                probe.push(WORD_SEP);
                probe.push_str(tenant);
                probe.push(LINE_SEP);
            } else {
                probe.push_str(md5);
                probe.push(LINE_SEP);
            }
        }
        probe
    }

    /// Sends one probe request; returns the `(dataId, group)` pairs whose
    /// content changed server-side.
    fn send_probe(&self, probe: &str) -> Result<Vec<(String, String)>, DiamondError> {
        let body = format!("Probe-Modify-Request={probe}");
        let host = self.ensure_host()?;
        let url = format!("{}/config.co", self.base_url(&host));
        let ts = sign::now_millis();
        let mut headers = sign::auth_headers(
            &self.config.access_key,
            &self.config.secret_key,
            self.tenant(),
            "",
            ts,
        );
        headers.push((
            "longPullingTimeout".to_string(),
            LONG_POLL_SERVER_TIMEOUT_MS.to_string(),
        ));
        let request = HttpRequest {
            method: Method::Post,
            url: url.clone(),
            headers,
            body: Some(body),
            timeout: LONG_POLL_TRANSPORT_TIMEOUT,
        };
        let response = match self.transport.request(request) {
            Ok(resp) if resp.status == 200 => resp,
            Ok(resp) => {
                let _ = self.reselect_host();
                return Err(DiamondError::ServerResponse {
                    url,
                    status: Some(resp.status),
                    detail: resp.body_str(),
                });
            }
            Err(detail) => {
                let _ = self.reselect_host();
                return Err(DiamondError::ServerResponse {
                    url,
                    status: None,
                    detail,
                });
            }
        };
        parse_probe_response(&response.body_str())
    }

    /// Re-fetches each `(dataId, group)` via `getConfig`, updating md5 and
    /// content, and deferring listener emission when content actually
    /// changed. A fetch failure reports and leaves the subscription as-is.
    fn sync_configs(&self, keys: &[(String, String)]) {
        for chunk in keys.chunks(5) {
            std::thread::scope(|scope| {
                for (data_id, group) in chunk {
                    scope.spawn(move || self.sync_one(data_id, group));
                }
            });
        }
    }

    fn sync_one(&self, data_id: &str, group: &str) {
        let result = self.get_config(data_id, group);
        let key = (data_id.to_string(), group.to_string());
        let mut subs = self.subscriptions.lock().unwrap();
        let Some(sub) = subs.get_mut(&key) else {
            return;
        };
        match result {
            Err(e) => {
                drop(subs);
                self.report(DiamondEvent::SyncConfig {
                    unit: self.unit.clone(),
                    data_id: data_id.to_string(),
                    group: group.to_string(),
                    detail: e.to_string(),
                });
            }
            Ok(content) => {
                let content = content.unwrap_or_default();
                let new_md5 = format!("{:x}", md5::compute(content.as_bytes()));
                if sub.md5.as_deref() != Some(new_md5.as_str()) {
                    sub.md5 = Some(new_md5);
                    sub.content = Some(content.clone());
                    let listeners = sub.listeners.clone();
                    drop(subs);
                    let _ = self
                        .dispatch_tx
                        .send(DispatchMessage::Emit(listeners, content));
                }
            }
        }
    }

    fn long_poll_loop(self: Arc<Self>, rx: Receiver<ControlMessage>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            let subs = self.snapshot_subs();
            if subs.is_empty() {
                break;
            }
            let unsynced: Vec<(String, String)> = subs
                .iter()
                .filter(|(_, _, md5)| md5.is_none())
                .map(|(d, g, _)| (d.clone(), g.clone()))
                .collect();
            if !unsynced.is_empty() {
                self.sync_configs(&unsynced);
            }

            let subs = self.snapshot_subs();
            if subs.is_empty() {
                break;
            }
            let probe = self.build_probe(&subs);

            match self.send_probe(&probe) {
                Ok(changed) if changed.is_empty() => {}
                Ok(changed) => self.sync_configs(&changed),
                Err(e) => {
                    self.report(DiamondEvent::LongPulling {
                        unit: self.unit.clone(),
                        detail: e.to_string(),
                    });
                    match rx.recv_timeout(LONG_POLL_ERROR_BACKOFF) {
                        Ok(ControlMessage::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    continue;
                }
            }

            if let Ok(ControlMessage::Quit) = rx.try_recv() {
                break;
            }
        }
        *self.long_poll_running.lock().unwrap() = false;
    }

    /// Stops the long-polling loop and the listener dispatch thread.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.long_poll_control.lock().unwrap().take() {
            let _ = tx.send(ControlMessage::Quit);
        }
        if let Some(handle) = self.long_poll_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.dispatch_tx.send(DispatchMessage::Quit);
        if let Some(handle) = self.dispatch_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UnitClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch_loop(rx: Receiver<DispatchMessage>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            DispatchMessage::Emit(listeners, content) => {
                for listener in listeners {
                    listener(&content);
                }
            }
            DispatchMessage::Quit => return,
        }
    }
}

/// URL-decodes the probe body, splits on `LINE_SEP`, and extracts the
/// leading `(dataId, group)` pair from each non-empty segment. A malformed
/// percent-encoding is reported like any other probe failure, never panics.
fn parse_probe_response(body: &str) -> Result<Vec<(String, String)>, DiamondError> {
    let decoded = urlencoding::decode(body)
        .map_err(|e| DiamondError::ServerResponse {
            url: "probe-response".to_string(),
            status: None,
            detail: e.to_string(),
        })?
        .into_owned();

    Ok(decoded
        .split(LINE_SEP)
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| {
            let mut parts = segment.split(WORD_SEP);
            let data_id = parts.next()?;
            let group = parts.next()?;
            Some((data_id.to_string(), group.to_string()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        responses: StdMutex<Vec<Result<HttpResponse, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<HttpResponse, String>>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn request(&self, _req: HttpRequest) -> Result<HttpResponse, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err("exhausted scripted responses".to_string());
            }
            responses.remove(0)
        }
    }

    struct NullDiscovery;
    impl diamond_server_list::DiscoveryTransport for NullDiscovery {
        fn get(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<diamond_server_list::DiscoveryResponse, String> {
            Ok(diamond_server_list::DiscoveryResponse {
                status: 200,
                body: "h1\n".to_string(),
            })
        }
    }

    fn test_client(transport: Arc<dyn Transport>) -> (Arc<UnitClient>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigBuilder::new()
                .endpoint("disco.example")
                .namespace("ns")
                .access_key("ak")
                .secret_key("sk")
                .build()
                .unwrap(),
        );
        let snapshot_sink: diamond_snapshot::EventSink = Arc::new(|_| {});
        let snapshot = Arc::new(Snapshot::new(dir.path(), snapshot_sink));
        let server_list = ServerListManager::new(
            config.endpoint.clone(),
            Arc::new(NullDiscovery),
            snapshot.clone(),
            Duration::from_secs(3600),
            config.request_timeout,
            Arc::new(|_| {}),
        );
        let client = UnitClient::new(
            "",
            config,
            transport,
            server_list,
            snapshot,
            Arc::new(|_| {}),
        );
        (client, dir)
    }

    #[test]
    fn get_config_returns_none_on_404() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse {
            status: 404,
            body: vec![],
        })]));
        let (client, _dir) = test_client(transport);
        assert_eq!(client.get_config("d", "g").unwrap(), None);
    }

    #[test]
    fn get_config_falls_back_to_snapshot_on_failure() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: b"v1".to_vec(),
        })]));
        let (client, _dir) = test_client(transport);
        assert_eq!(client.get_config("d", "g").unwrap(), Some("v1".to_string()));

        // second transport exhausted -> falls back to the snapshot just written
        let failing: Arc<dyn Transport> =
            Arc::new(ScriptedTransport::new(vec![Err("boom".to_string())]));
        let snapshot = client.snapshot.clone();
        let config = client.config.clone();
        let server_list = client.server_list.clone();
        let client2 = UnitClient::new("", config, failing, server_list, snapshot, Arc::new(|_| {}));
        assert_eq!(client2.get_config("d", "g").unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn probe_parses_changed_keys() {
        let body = format!("d1{WORD_SEP}g1{LINE_SEP}d2{WORD_SEP}g2{LINE_SEP}");
        let changed = parse_probe_response(&body).unwrap();
        assert_eq!(
            changed,
            vec![("d1".to_string(), "g1".to_string()), ("d2".to_string(), "g2".to_string())]
        );
    }

    #[test]
    fn sync_one_debounces_identical_content() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }),
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }),
        ]));
        let (client, _dir) = test_client(transport);
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let listener: Listener = Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        client.subscriptions.lock().unwrap().insert(
            ("d".to_string(), "g".to_string()),
            Subscription {
                data_id: "d".to_string(),
                group: "g".to_string(),
                md5: None,
                content: None,
                listeners: vec![listener],
            },
        );
        client.sync_one("d", "g");
        client.sync_one("d", "g");
        // dispatch is async; give the dispatch thread a moment to run
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![]));
        let (client, _dir) = test_client(transport);
        client.close();
        client.close();
    }

    // ---- subscribe / unsubscribe, end to end (spec §8 scenarios B/C, properties 2/3) ---

    #[test]
    fn subscribe_delivers_initial_value_once_deferred() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }), // initial sync
            Ok(HttpResponse { status: 200, body: vec![] }),         // first probe: no change
        ]));
        let (client, _dir) = test_client(transport);
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let captured = hits.clone();
        let listener: Listener = Arc::new(move |content| captured.lock().unwrap().push(content.to_string()));

        client.subscribe("d", "g", listener);
        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(*hits.lock().unwrap(), vec!["v1".to_string()]);
    }

    #[test]
    fn probe_reported_change_triggers_resync_and_new_emission() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }), // initial sync
            Ok(HttpResponse {
                status: 200,
                body: format!("d{WORD_SEP}g{LINE_SEP}").into_bytes(),
            }), // probe: (d, g) changed
            Ok(HttpResponse { status: 200, body: b"v2".to_vec() }), // resync fetch
            Ok(HttpResponse { status: 200, body: vec![] }),         // next probe: no further change
        ]));
        let (client, _dir) = test_client(transport);
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let captured = hits.clone();
        let listener: Listener = Arc::new(move |content| captured.lock().unwrap().push(content.to_string()));

        client.subscribe("d", "g", listener);
        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(*hits.lock().unwrap(), vec!["v1".to_string(), "v2".to_string()]);
    }

    #[test]
    fn resubscribe_to_synced_key_emits_cached_value_only_to_new_listener() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }), // initial sync
            Ok(HttpResponse { status: 200, body: vec![] }),         // first probe: no change
        ]));
        let (client, _dir) = test_client(transport);

        let hits1 = Arc::new(StdMutex::new(Vec::new()));
        let captured1 = hits1.clone();
        let listener1: Listener = Arc::new(move |content| captured1.lock().unwrap().push(content.to_string()));
        client.subscribe("d", "g", listener1);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(*hits1.lock().unwrap(), vec!["v1".to_string()]);

        let hits2 = Arc::new(StdMutex::new(Vec::new()));
        let captured2 = hits2.clone();
        let listener2: Listener = Arc::new(move |content| captured2.lock().unwrap().push(content.to_string()));
        client.subscribe("d", "g", listener2);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(*hits2.lock().unwrap(), vec!["v1".to_string()]);
        assert_eq!(*hits1.lock().unwrap(), vec!["v1".to_string()]);
    }

    #[test]
    fn unsubscribe_removes_subscription_and_further_sync_is_a_no_op() {
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 200, body: b"v1".to_vec() }), // initial sync
            Ok(HttpResponse { status: 200, body: vec![] }),         // first probe: no change
        ]));
        let (client, _dir) = test_client(transport);
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let captured = hits.clone();
        let listener: Listener = Arc::new(move |content| captured.lock().unwrap().push(content.to_string()));

        client.subscribe("d", "g", listener.clone());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(*hits.lock().unwrap(), vec!["v1".to_string()]);

        client.unsubscribe("d", "g", Some(&listener));
        assert!(client.subscriptions.lock().unwrap().is_empty());

        // Simulates a resync completing after the subscription was already
        // removed -- must discard silently, per §4.5 diffing rule 2.
        client.sync_one("d", "g");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(*hits.lock().unwrap(), vec!["v1".to_string()]);
    }
}
