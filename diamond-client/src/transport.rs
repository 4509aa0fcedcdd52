//! The raw HTTP contract the signed request layer builds on.
//!
//! Kept intentionally dumb: no signing, no retries, no snapshot awareness.
//! Those live in `unit_client` so that tests can inject a `Transport` stub
//! and exercise that behavior without a live server.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// `request(url, {method, data, headers, timeout, dataType}) -> {status, data}`
/// from spec §6. Anything satisfying this can back a `UnitClient`.
pub trait Transport: Send + Sync {
    fn request(&self, req: HttpRequest) -> Result<HttpResponse, String>;
}

/// Production transport backed by `ureq`.
///
/// `insecure_skip_verify` disables peer certificate verification when TLS
/// is in use -- a hard protocol requirement of the config service, not a
/// recommendation (see spec §9). It is never enabled implicitly; callers
/// must opt in through `Config`.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(insecure_skip_verify: bool) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if insecure_skip_verify {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
                .build()
                .expect("building a permissive TLS connector should not fail");
            builder = builder.tls_connector(Arc::new(connector));
        }
        Self {
            agent: builder.build(),
        }
    }
}

impl Transport for UreqTransport {
    fn request(&self, req: HttpRequest) -> Result<HttpResponse, String> {
        let mut request = self
            .agent
            .request(req.method.as_str(), &req.url)
            .timeout(req.timeout);
        for (name, value) in &req.headers {
            request = request.set(name, value);
        }

        let outcome = match req.body {
            Some(body) => request.send_string(&body),
            None => request.call(),
        };

        match outcome {
            Ok(response) => read_response(response),
            Err(ureq::Error::Status(_, response)) => read_response(response),
            Err(ureq::Error::Transport(transport)) => Err(transport.to_string()),
        }
    }
}

fn read_response(response: ureq::Response) -> Result<HttpResponse, String> {
    let status = response.status();
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| e.to_string())?;
    Ok(HttpResponse { status, body })
}
