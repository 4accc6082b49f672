//! Credential proxy server
//!
//! One loopback listener per task. The child talks to it with a placeholder
//! credential; the proxy checks the placeholder, swaps in the real value and
//! relays the request to the single configured upstream.

use crate::credential::{SessionAuth, ENV_BASE_URL, X_API_KEY};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::uri::Authority;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use relay_foundation::{Error, Result, UpstreamCredential};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Max wait for in-flight requests on stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Headers that belong to a single hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy settings
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// The only upstream requests are forwarded to
    pub upstream: Url,

    pub connect_timeout: Duration,
}

impl ProxySettings {
    pub fn new(upstream: Url) -> Self {
        Self {
            upstream,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &relay_foundation::ProxyConfig) -> Result<Self> {
        Ok(Self {
            upstream: config.upstream()?,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }
}

struct ProxyState {
    upstream: Url,
    port: u16,
    auth: SessionAuth,
    client: reqwest::Client,
}

/// A running proxy session
pub struct CredentialProxy {
    addr: SocketAddr,
    placeholder: String,
    env_name: &'static str,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialProxy {
    /// Bind `127.0.0.1:0` and start serving
    pub async fn start(settings: ProxySettings, credential: UpstreamCredential) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Upstream(format!("failed to bind proxy listener: {}", e)))?;
        let addr = listener.local_addr()?;

        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Http(format!("failed to build upstream client: {}", e)))?;

        let auth = SessionAuth::new(credential);
        let placeholder = auth.placeholder().to_string();
        let env_name = auth.env_name();
        let scheme = auth.scheme_name();

        let state = Arc::new(ProxyState {
            upstream: settings.upstream.clone(),
            port: addr.port(),
            auth,
            client,
        });
        let router = Router::new().fallback(forward).with_state(state);

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Credential proxy server failed");
            }
        });

        info!(port = addr.port(), upstream = %settings.upstream, scheme, "Credential proxy listening");

        Ok(Self {
            addr,
            placeholder,
            env_name,
            shutdown: Mutex::new(Some(tx)),
            server: Mutex::new(Some(server)),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    /// Placeholder the child must present
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Env for the child: base URL plus the placeholder for the active scheme
    pub fn child_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_BASE_URL.to_string(), self.base_url()),
            (self.env_name.to_string(), self.placeholder.clone()),
        ]
    }

    /// Close the listener. Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(mut server) = self.server.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                debug!(port = self.port(), "Proxy connections still open, aborting");
                server.abort();
            }
            info!(port = self.port(), "Credential proxy stopped");
        }
    }
}

impl Drop for CredentialProxy {
    fn drop(&mut self) {
        if let Ok(mut server) = self.server.try_lock() {
            if let Some(server) = server.take() {
                server.abort();
            }
        }
    }
}

// ============================================================================
// Request handling
// ============================================================================

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    // absolute-form targets are never forwarded
    if parts.uri.scheme().is_some() || parts.uri.authority().is_some() {
        warn!(uri = %parts.uri, "Refusing absolute-form request");
        return refuse(
            StatusCode::FORBIDDEN,
            "host_not_allowed",
            "absolute-form requests are not proxied",
        );
    }
    if let Some(host) = parts.headers.get(header::HOST) {
        let allowed = host
            .to_str()
            .map(|h| state.host_allowed(h))
            .unwrap_or(false);
        if !allowed {
            warn!(host = ?host, "Refusing request for foreign host");
            return refuse(
                StatusCode::FORBIDDEN,
                "host_not_allowed",
                "requests may only target the configured upstream",
            );
        }
    }

    let header_str = |name: &HeaderName| parts.headers.get(name).and_then(|v| v.to_str().ok());
    let (auth_name, auth_value) = match state
        .auth
        .substitute(header_str(&X_API_KEY), header_str(&header::AUTHORIZATION))
    {
        Ok(substitution) => substitution,
        Err(e) => {
            warn!(path = %path, scheme = state.auth.scheme_name(), error = %e, "Rejected request without session placeholder");
            return reject(StatusCode::UNAUTHORIZED, &e);
        }
    };

    let mut headers = strip_hop_by_hop(&parts.headers);
    headers.remove(header::HOST);
    headers.insert(auth_name, auth_value);

    let url = state.target_url(&parts.uri);
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    let upstream = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream {
        Ok(resp) => {
            debug!(method = %parts.method, path = %path, status = resp.status().as_u16(), "Proxied request");
            let status = resp.status();
            let headers = strip_hop_by_hop(resp.headers());
            let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            warn!(method = %parts.method, path = %path, error = %e, "Upstream unreachable");
            let err = Error::Upstream("upstream could not be reached".into());
            let mut response = reject(StatusCode::BAD_GATEWAY, &err);
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

impl ProxyState {
    fn host_allowed(&self, raw: &str) -> bool {
        let Ok(authority) = Authority::from_str(raw.trim()) else {
            return false;
        };
        let host = authority.host();

        let loopback = host == "127.0.0.1" || host.eq_ignore_ascii_case("localhost");
        if loopback && authority.port_u16() == Some(self.port) {
            return true;
        }

        match self.upstream.host_str() {
            Some(upstream_host) if host.eq_ignore_ascii_case(upstream_host) => {
                authority.port_u16().or(default_port(&self.upstream))
                    == self.upstream.port_or_known_default()
            }
            _ => false,
        }
    }

    fn target_url(&self, uri: &axum::http::Uri) -> Url {
        let mut url = self.upstream.clone();
        let prefix = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", prefix, uri.path()));
        url.set_query(uri.query());
        url
    }
}

fn default_port(url: &Url) -> Option<u16> {
    match url.scheme() {
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // names listed in `connection` are hop-by-hop for this message too
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn reject(status: StatusCode, err: &Error) -> Response {
    refuse(status, err.kind(), &err.to_string())
}

fn refuse(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": { "type": kind, "message": message },
    });
    (status, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(upstream: &str, port: u16) -> ProxyState {
        ProxyState {
            upstream: Url::parse(upstream).unwrap(),
            port,
            auth: SessionAuth::new(UpstreamCredential::ApiKey("sk".into())),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_host_allowlist() {
        let s = state("https://api.anthropic.com", 4000);
        assert!(s.host_allowed("127.0.0.1:4000"));
        assert!(s.host_allowed("localhost:4000"));
        assert!(s.host_allowed("api.anthropic.com"));
        assert!(s.host_allowed("API.anthropic.com:443"));
        assert!(!s.host_allowed("127.0.0.1:4001"));
        assert!(!s.host_allowed("api.anthropic.com:80"));
        assert!(!s.host_allowed("evil.example"));
        assert!(!s.host_allowed(""));
    }

    #[test]
    fn test_target_url_keeps_prefix_and_query() {
        let s = state("http://upstream.local:8080/base/", 1);
        let uri: axum::http::Uri = "/v1/messages?beta=true".parse().unwrap();
        assert_eq!(
            s.target_url(&uri).as_str(),
            "http://upstream.local:8080/base/v1/messages?beta=true"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(header::CONTENT_TYPE));
    }
}
