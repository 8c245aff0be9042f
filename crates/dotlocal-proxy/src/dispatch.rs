//! Request dispatch for dedicated and shared listeners

use crate::forward::{forward, Forwarded};
use crate::{Backend, ProxyConfig, ProxyError};
use bytes::Bytes;
use dotlocal_router::{strip_port, Route, RouteTable};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Body type of every response produced by the dispatcher
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection the request arrived on
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub peer_addr: SocketAddr,
    /// Whether the client connection is TLS
    pub secure: bool,
}

impl ClientInfo {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

/// Where requests go
#[derive(Clone)]
pub enum DispatchMode {
    /// Every request goes to one backend
    Dedicated(Backend),
    /// The request's Host selects a route
    Shared(Arc<RouteTable>),
}

/// HTTP handler that forwards requests to the resolved backend
#[derive(Clone)]
pub struct Dispatcher {
    mode: DispatchMode,
    config: ProxyConfig,
}

impl Dispatcher {
    pub fn dedicated(backend: Backend, config: ProxyConfig) -> Self {
        Self {
            mode: DispatchMode::Dedicated(backend),
            config,
        }
    }

    pub fn shared(routes: Arc<RouteTable>, config: ProxyConfig) -> Self {
        Self {
            mode: DispatchMode::Shared(routes),
            config,
        }
    }

    pub fn mode(&self) -> &DispatchMode {
        &self.mode
    }

    /// Handle one request; failures become 404 / 502 responses
    pub async fn dispatch<B>(&self, req: Request<B>, client: ClientInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match &self.mode {
            DispatchMode::Dedicated(backend) => {
                debug!("{} {} -> {}", method, path, backend.authority());
                forward(req, backend, None, &self.config).await
            }
            DispatchMode::Shared(routes) => {
                let host = request_host(&req).unwrap_or_default();
                let route = match routes.lookup(&host) {
                    Ok(route) => route,
                    Err(_) => {
                        info!("No route for host '{}' ({} {})", host, method, path);
                        return not_found(strip_port(&host), &routes.list());
                    }
                };

                debug!("{} {}{} -> {}", method, host, path, route.target_authority());
                let backend = Backend::from(&route);
                let forwarded = Forwarded {
                    client: &client,
                    host: &host,
                };
                forward(req, &backend, Some(forwarded), &self.config).await
            }
        };

        match result {
            Ok(response) => {
                debug!("{} {} <- {}", method, path, response.status());
                response
            }
            Err(e) => {
                warn!("Proxy error for {} {}: {}", method, path, e);
                bad_gateway(&e)
            }
        }
    }
}

/// Host named by the request: the Host header, else the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// 404 page naming the unmatched host and listing known routes
///
/// Output depends only on `host` and `routes`, so identical inputs render
/// identical pages.
pub fn not_found(host: &str, routes: &BTreeMap<String, Route>) -> Response<ProxyBody> {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>Tunnel Not Found</title></head>\n<body>\n");
    page.push_str("<h1>dotlocal - Route Not Found</h1>\n");
    let _ = writeln!(
        page,
        "<p>No tunnel configured for <strong>{}</strong></p>",
        escape_html(host)
    );

    if routes.is_empty() {
        page.push_str("<p>No tunnels are running.</p>\n");
    } else {
        page.push_str("<p>Available routes:</p>\n<ul>\n");
        for domain in routes.keys() {
            let _ = writeln!(page, "<li>{}</li>", escape_html(domain));
        }
        page.push_str("</ul>\n");
    }

    page.push_str(
        "<p><em>Start a tunnel with: <code>dotlocal start [name] --port [port]</code></em></p>\n</body>\n</html>\n",
    );

    let mut response = Response::new(full(page));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// 502 (504 for a backend that never answered) with a plain-text diagnostic
pub fn bad_gateway(error: &ProxyError) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("Proxy Error: {}\n", error)));
    *response.status_mut() = match error {
        ProxyError::ResponseTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
