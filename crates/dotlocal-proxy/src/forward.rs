//! Forwarding a single request to a backend over a fresh HTTP/1.1 connection

use crate::dispatch::{ClientInfo, ProxyBody};
use crate::{Backend, ProxyConfig, ProxyError};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Headers that describe one connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Original request facts carried to the backend in shared mode
#[derive(Debug, Clone)]
pub struct Forwarded<'a> {
    pub client: &'a ClientInfo,
    /// Host header exactly as the client sent it
    pub host: &'a str,
}

/// Whether the request asks for a protocol switch (e.g. WebSocket)
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove hop-by-hop headers, including any named by `Connection`
///
/// With `keep_upgrade` the `Connection: upgrade` / `Upgrade` pair survives.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    let upgrade = headers.get(header::UPGRADE).cloned();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }

    if keep_upgrade {
        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
    }
}

/// Set `X-Forwarded-*` headers, appending to an existing `X-Forwarded-For`
pub fn set_forwarded_headers(headers: &mut HeaderMap, forwarded: &Forwarded<'_>) {
    let client_ip = forwarded.client.peer_addr.ip().to_string();
    let xff = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };

    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(forwarded.client.scheme()),
    );
    if let Ok(value) = HeaderValue::from_str(forwarded.host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
}

/// Rewrite `req` for `backend` and send it, returning the backend response
///
/// Upgrade requests answered with `101 Switching Protocols` get a background
/// task that copies bytes between client and backend until either closes.
pub async fn forward<B>(
    mut req: Request<B>,
    backend: &Backend,
    forwarded: Option<Forwarded<'_>>,
    config: &ProxyConfig,
) -> Result<Response<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let target = backend.authority();
    let upgrade = is_upgrade_request(req.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("bad request target {}: {}", path, e)))?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers, upgrade);
    let host = HeaderValue::from_str(&target)
        .map_err(|e| ProxyError::InvalidRequest(format!("bad backend authority {}: {}", target, e)))?;
    parts.headers.insert(header::HOST, host);
    if let Some(forwarded) = &forwarded {
        set_forwarded_headers(&mut parts.headers, forwarded);
    }

    let outbound = Request::from_parts(parts, body);

    let dial_timeout = config.dial_timeout;
    let response_timeout = config.response_timeout;
    let timed_out = |target: &str| ProxyError::ResponseTimeout {
        target: target.to_string(),
        timeout: response_timeout,
    };

    trace!("Dialing backend {}", target);
    let stream = timeout(dial_timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| ProxyError::ConnectTimeout {
            target: target.clone(),
            timeout: dial_timeout,
        })?
        .map_err(|e| ProxyError::ConnectionFailed {
            target: target.clone(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = timeout(response_timeout, http1::handshake(TokioIo::new(stream)))
        .await
        .map_err(|_| timed_out(&target))?
        .map_err(|e| ProxyError::ConnectionFailed {
            target: target.clone(),
            reason: format!("HTTP handshake failed: {}", e),
        })?;

    // Connection driver; `with_upgrades` keeps the socket alive after a 101
    let driver_target = target.clone();
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Backend connection to {} closed: {}", driver_target, e);
        }
    });

    let mut response = match timeout(response_timeout, sender.send_request(outbound)).await {
        Ok(result) => result
            .map_err(|e| ProxyError::RequestFailed(format!("{} did not answer: {}", target, e)))?,
        Err(_) => {
            driver.abort();
            return Err(timed_out(&target));
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel_upgraded(client_upgrade, backend_upgrade, target));
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, crate::dispatch::empty()));
        }
    } else {
        strip_hop_by_hop(response.headers_mut(), false);
    }

    Ok(response.map(|body| body.boxed()))
}

async fn tunnel_upgraded(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
    target: String,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Upgrade to {} failed: {}", target, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => debug!(
            "Upgraded connection to {} closed ({} bytes up, {} bytes down)",
            target, to_backend, to_client
        ),
        Err(e) => debug!("Upgraded connection to {} ended: {}", target, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn client(secure: bool) -> ClientInfo {
        ClientInfo {
            peer_addr: "192.168.1.7:51000".parse::<SocketAddr>().unwrap(),
            secure,
        }
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers, false);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-secret").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn test_upgrade_headers_survive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        assert!(is_upgrade_request(&headers));
        strip_hop_by_hop(&mut headers, true);

        assert_eq!(headers.get(header::CONNECTION).unwrap(), "upgrade");
        assert_eq!(headers.get(header::UPGRADE).unwrap(), "websocket");
    }

    #[test]
    fn test_not_upgrade_without_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn test_forwarded_headers() {
        let mut headers = HeaderMap::new();
        let info = client(true);
        set_forwarded_headers(
            &mut headers,
            &Forwarded {
                client: &info,
                host: "app.local:8443",
            },
        );

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.7");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "app.local:8443");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let info = client(false);
        set_forwarded_headers(
            &mut headers,
            &Forwarded {
                client: &info,
                host: "app.local",
            },
        );

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, 192.168.1.7");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }
}
