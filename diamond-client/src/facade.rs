//! The multi-unit façade (spec §4.6) -- the one type application code holds.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use diamond_server_list::ServerListManager;
use diamond_snapshot::Snapshot;

use crate::config::Config;
use crate::error::{DiamondError, DiamondEvent};
use crate::transport::{Transport, UreqTransport};
use crate::unit_client::{ConfigItem, Listener, UnitClient};

enum DispatchMessage {
    Emit(DiamondEvent),
    Quit,
}

/// Owns the server list manager, the snapshot store, and a lazily populated
/// registry of per-unit clients sharing both. Re-export target for
/// application code; constructed once from a validated [`Config`].
pub struct Facade {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    snapshot: Arc<Snapshot>,
    server_list: Arc<ServerListManager>,
    clients: Mutex<HashMap<String, Arc<UnitClient>>>,
    dispatch_tx: Sender<DispatchMessage>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Facade {
    /// Builds a façade from `config`, using the production `ureq`-backed
    /// transport. `on_error` receives every reportable event, deferred to a
    /// dedicated dispatch thread so a misbehaving handler cannot re-enter
    /// the emitter (spec §6).
    pub fn new(
        config: Config,
        on_error: impl Fn(DiamondEvent) + Send + Sync + 'static,
    ) -> Result<Arc<Self>, DiamondError> {
        let transport: Arc<dyn Transport> =
            Arc::new(UreqTransport::new(config.insecure_skip_verify));
        Self::with_transport(config, transport, on_error)
    }

    /// As [`Facade::new`], but with an injected transport -- used by tests
    /// and by callers who want to supply their own HTTP stack (spec §6,
    /// `httpclient`).
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        on_error: impl Fn(DiamondEvent) + Send + Sync + 'static,
    ) -> Result<Arc<Self>, DiamondError> {
        let config = Arc::new(config);
        let on_error: Arc<dyn Fn(DiamondEvent) + Send + Sync> = Arc::new(on_error);

        let (dispatch_tx, dispatch_rx) = channel();
        let dispatch_handle = std::thread::spawn(move || dispatch_loop(dispatch_rx, on_error));

        let snapshot_tx = dispatch_tx.clone();
        let snapshot_sink: diamond_snapshot::EventSink = Arc::new(move |event| {
            let _ = snapshot_tx.send(DispatchMessage::Emit(DiamondEvent::from_snapshot(event)));
        });
        let snapshot = Arc::new(Snapshot::new(config.cache_dir.clone(), snapshot_sink));

        let server_list_tx = dispatch_tx.clone();
        let discovery_transport: Arc<dyn diamond_server_list::DiscoveryTransport> =
            Arc::new(HttpDiscovery(transport.clone()));
        let server_list = ServerListManager::new(
            config.endpoint.clone(),
            discovery_transport,
            snapshot.clone(),
            config.refresh_interval,
            config.request_timeout,
            Arc::new(move |event| {
                let _ = server_list_tx.send(DispatchMessage::Emit(
                    DiamondEvent::from_server_list(event),
                ));
            }),
        );

        Ok(Arc::new(Self {
            config,
            transport,
            snapshot,
            server_list,
            clients: Mutex::new(HashMap::new()),
            dispatch_tx,
            dispatch_handle: Mutex::new(Some(dispatch_handle)),
        }))
    }

    fn client_for(&self, unit: &str) -> Arc<UnitClient> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(unit) {
            return client.clone();
        }
        let unit_owned = unit.to_string();
        let tx = self.dispatch_tx.clone();
        let sink: crate::error::EventSink = Arc::new(move |event| {
            let _ = tx.send(DispatchMessage::Emit(event));
        });
        let client = UnitClient::new(
            unit.to_string(),
            self.config.clone(),
            self.transport.clone(),
            self.server_list.clone(),
            self.snapshot.clone(),
            sink,
        );
        clients.insert(unit_owned, client.clone());
        client
    }

    fn current_unit(&self) -> String {
        self.server_list
            .get_current_unit()
            .unwrap_or_default()
    }

    fn resolve_unit(&self, unit: Option<&str>) -> String {
        match unit {
            Some(u) => u.to_string(),
            None => self.current_unit(),
        }
    }

    // ---- forwarding verbs ---------------------------------------------

    pub fn get_config(
        &self,
        data_id: &str,
        group: &str,
        unit: Option<&str>,
    ) -> Result<Option<String>, DiamondError> {
        self.client_for(&self.resolve_unit(unit)).get_config(data_id, group)
    }

    pub fn publish_single(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
        unit: Option<&str>,
    ) -> Result<(), DiamondError> {
        self.client_for(&self.resolve_unit(unit))
            .publish_single(data_id, group, content)
    }

    pub fn remove(
        &self,
        data_id: &str,
        group: &str,
        unit: Option<&str>,
    ) -> Result<(), DiamondError> {
        self.client_for(&self.resolve_unit(unit)).remove(data_id, group)
    }

    pub fn publish_aggr(
        &self,
        data_id: &str,
        group: &str,
        datum_id: &str,
        content: &str,
        unit: Option<&str>,
    ) -> Result<(), DiamondError> {
        self.client_for(&self.resolve_unit(unit))
            .publish_aggr(data_id, group, datum_id, content)
    }

    pub fn remove_aggr(
        &self,
        data_id: &str,
        group: &str,
        datum_id: &str,
        unit: Option<&str>,
    ) -> Result<(), DiamondError> {
        self.client_for(&self.resolve_unit(unit))
            .remove_aggr(data_id, group, datum_id)
    }

    pub fn batch_get_config(
        &self,
        data_ids: &[String],
        group: &str,
        unit: Option<&str>,
    ) -> Result<Vec<(String, String, i32, Option<String>)>, DiamondError> {
        self.client_for(&self.resolve_unit(unit))
            .batch_get_config(data_ids, group)
    }

    pub fn batch_query(
        &self,
        data_ids: &[String],
        group: &str,
        unit: Option<&str>,
    ) -> Result<String, DiamondError> {
        self.client_for(&self.resolve_unit(unit))
            .batch_query(data_ids, group)
    }

    pub fn get_all_config_info(&self, unit: Option<&str>) -> Result<Vec<ConfigItem>, DiamondError> {
        self.client_for(&self.resolve_unit(unit)).get_all_config_info()
    }

    pub fn subscribe(&self, data_id: &str, group: &str, unit: Option<&str>, listener: Listener) {
        self.client_for(&self.resolve_unit(unit))
            .subscribe(data_id, group, listener)
    }

    pub fn unsubscribe(
        &self,
        data_id: &str,
        group: &str,
        unit: Option<&str>,
        listener: Option<&Listener>,
    ) {
        self.client_for(&self.resolve_unit(unit))
            .unsubscribe(data_id, group, listener)
    }

    // ---- fan-out verbs (§4.4) -------------------------------------------

    /// Publishes to every known unit in parallel; fails unless all succeed.
    pub fn publish_to_all_units(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
    ) -> Result<(), DiamondError> {
        let units = self
            .server_list
            .fetch_unit_lists()
            .map_err(|e| DiamondError::ServerResponse {
                url: "unit-list".to_string(),
                status: None,
                detail: e.to_string(),
            })?;
        let results: Vec<Result<(), DiamondError>> = std::thread::scope(|scope| {
            units
                .iter()
                .map(|unit| {
                    scope.spawn(move || {
                        self.publish_single(data_id, group, content, Some(unit.as_str()))
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        results.into_iter().collect()
    }

    /// Removes from every known unit in parallel; fails unless all succeed.
    pub fn remove_from_all_units(&self, data_id: &str, group: &str) -> Result<(), DiamondError> {
        let units = self
            .server_list
            .fetch_unit_lists()
            .map_err(|e| DiamondError::ServerResponse {
                url: "unit-list".to_string(),
                status: None,
                detail: e.to_string(),
            })?;
        let results: Vec<Result<(), DiamondError>> = std::thread::scope(|scope| {
            units
                .iter()
                .map(|unit| scope.spawn(move || self.remove(data_id, group, Some(unit.as_str()))))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        results.into_iter().collect()
    }

    /// Stops the server list manager and every known `UnitClient`, then
    /// clears the registry. Idempotent.
    pub fn close(&self) {
        self.server_list.close();
        let mut clients = self.clients.lock().unwrap();
        for (_, client) in clients.drain() {
            client.close();
        }
        let _ = self.dispatch_tx.send(DispatchMessage::Quit);
        if let Some(handle) = self.dispatch_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Facade {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch_loop(rx: Receiver<DispatchMessage>, on_error: Arc<dyn Fn(DiamondEvent) + Send + Sync>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            DispatchMessage::Emit(event) => on_error(event),
            DispatchMessage::Quit => return,
        }
    }
}

/// Adapts the façade's `Transport` to the narrower `DiscoveryTransport`
/// contract the server list manager depends on.
struct HttpDiscovery(Arc<dyn Transport>);

impl diamond_server_list::DiscoveryTransport for HttpDiscovery {
    fn get(
        &self,
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<diamond_server_list::DiscoveryResponse, String> {
        let request = crate::transport::HttpRequest {
            method: crate::transport::Method::Get,
            url: url.to_string(),
            headers: vec![],
            body: None,
            timeout,
        };
        self.0
            .request(request)
            .map(|resp| diamond_server_list::DiscoveryResponse {
                status: resp.status,
                body: resp.body_str(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::transport::HttpResponse;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Routes by the first matching substring in the request URL -- same
    /// scripting style as `diamond_server_list::manager`'s test transport.
    struct ScriptedTransport {
        routes: StdMutex<Vec<(&'static str, Result<HttpResponse, String>)>>,
    }

    impl ScriptedTransport {
        fn new(routes: Vec<(&'static str, Result<HttpResponse, String>)>) -> Self {
            Self {
                routes: StdMutex::new(routes),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn request(&self, req: crate::transport::HttpRequest) -> Result<HttpResponse, String> {
            let mut routes = self.routes.lock().unwrap();
            if let Some(pos) = routes.iter().position(|(needle, _)| req.url.contains(needle)) {
                return routes.remove(pos).1;
            }
            Err(format!("no scripted route for {}", req.url))
        }
    }

    fn test_facade(
        dir: &tempfile::TempDir,
        transport: Arc<dyn Transport>,
    ) -> Arc<Facade> {
        let config = ConfigBuilder::new()
            .endpoint("disco.example")
            .namespace("ns")
            .access_key("ak")
            .secret_key("sk")
            .cache_dir(dir.path())
            .refresh_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        Facade::with_transport(config, transport, |_| {}).unwrap()
    }

    #[test]
    fn get_config_round_trips_through_discovery_and_http() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            (
                "diamond-server/diamond-unit-",
                Ok(HttpResponse { status: 200, body: b"h1".to_vec() }),
            ),
            (
                "/config.co",
                Ok(HttpResponse { status: 200, body: b"v1".to_vec() }),
            ),
        ]));
        let facade = test_facade(&dir, transport);
        let value = facade.get_config("d", "g", Some("u1")).unwrap();
        assert_eq!(value, Some("v1".to_string()));
        facade.close();
    }

    #[test]
    fn get_config_returns_none_on_404() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            (
                "diamond-server/diamond-unit-",
                Ok(HttpResponse { status: 200, body: b"h1".to_vec() }),
            ),
            ("/config.co", Ok(HttpResponse { status: 404, body: vec![] })),
        ]));
        let facade = test_facade(&dir, transport);
        assert_eq!(facade.get_config("d", "g", Some("u1")).unwrap(), None);
        facade.close();
    }

    #[test]
    fn publish_to_all_units_fails_if_any_unit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![
            ("unit-list", Ok(HttpResponse { status: 200, body: b"u1\nu2".to_vec() })),
            (
                "diamond-unit-u1",
                Ok(HttpResponse { status: 200, body: b"h1".to_vec() }),
            ),
            (
                "diamond-unit-u2",
                Ok(HttpResponse { status: 200, body: b"h2".to_vec() }),
            ),
            (
                "basestone.do",
                Ok(HttpResponse { status: 200, body: vec![] }),
            ),
            (
                "basestone.do",
                Ok(HttpResponse { status: 500, body: b"boom".to_vec() }),
            ),
        ]));
        let facade = test_facade(&dir, transport);
        let result = facade.publish_to_all_units("d", "g", "v1");
        assert!(result.is_err());
        facade.close();
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(vec![]));
        let facade = test_facade(&dir, transport);
        facade.close();
        facade.close();
    }
}
