//! Tunnel Manager lifecycle against in-memory collaborators and real sockets

use async_trait::async_trait;
use dotlocal_cert::CertificateProvider;
use dotlocal_control::{
    BoxError, ErrorKind, HostsBackup, HostsFile, ListenMode, ManagerConfig, Registrar,
    TunnelError, TunnelManager, TunnelSummary,
};
use dotlocal_proxy::{SharedProxy, SharedProxyConfig};
use dotlocal_router::RouteTable;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ORIGINAL_HOSTS: &str = "# static table lookup for hostnames\n127.0.0.1\tlocalhost\n::1\tlocalhost\n";

/// Hosts file kept in memory
struct FakeHosts {
    content: Mutex<String>,
    fail_update: AtomicBool,
    fail_backup: AtomicBool,
}

impl FakeHosts {
    fn new() -> Self {
        Self {
            content: Mutex::new(ORIGINAL_HOSTS.to_string()),
            fail_update: AtomicBool::new(false),
            fail_backup: AtomicBool::new(false),
        }
    }

    fn content(&self) -> String {
        self.content.lock().unwrap().clone()
    }

    fn maps(&self, domain: &str) -> bool {
        self.content()
            .lines()
            .any(|line| line.split_whitespace().skip(1).any(|name| name == domain))
    }
}

#[async_trait]
impl HostsFile for FakeHosts {
    async fn update(&self, domain: &str) -> Result<(), BoxError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err("hosts file is read-only".into());
        }
        if !self.maps(domain) {
            self.content
                .lock()
                .unwrap()
                .push_str(&format!("127.0.0.1\t{}\n", domain));
        }
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<(), BoxError> {
        let mut content = self.content.lock().unwrap();
        let kept: String = content
            .lines()
            .filter(|line| !line.split_whitespace().skip(1).any(|name| name == domain))
            .map(|line| format!("{}\n", line))
            .collect();
        *content = kept;
        Ok(())
    }

    async fn backup(&self) -> Result<HostsBackup, BoxError> {
        if self.fail_backup.load(Ordering::SeqCst) {
            return Err("permission denied".into());
        }
        Ok(HostsBackup::new(self.content().into_bytes()))
    }

    async fn restore(&self, backup: &HostsBackup) -> Result<(), BoxError> {
        *self.content.lock().unwrap() = String::from_utf8(backup.content().to_vec())?;
        Ok(())
    }
}

/// Registrar recording advertised domains
#[derive(Default)]
struct FakeRegistrar {
    registered: Mutex<HashMap<String, u16>>,
    fail_register: AtomicBool,
}

impl FakeRegistrar {
    fn port_of(&self, domain: &str) -> Option<u16> {
        self.registered.lock().unwrap().get(domain).copied()
    }

    fn is_empty(&self) -> bool {
        self.registered.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn register(&self, domain: &str, port: u16) -> Result<(), BoxError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err("discovery responder unavailable".into());
        }
        self.registered
            .lock()
            .unwrap()
            .insert(domain.to_string(), port);
        Ok(())
    }

    async fn unregister(&self, domain: &str) -> Result<(), BoxError> {
        self.registered.lock().unwrap().remove(domain);
        Ok(())
    }

    fn outbound_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

struct Harness {
    dir: TempDir,
    hosts: Arc<FakeHosts>,
    registrar: Arc<FakeRegistrar>,
    manager: Arc<TunnelManager>,
}

impl Harness {
    fn dedicated() -> Self {
        Self::with_mode(ListenMode::Dedicated)
    }

    fn with_mode(mode: ListenMode) -> Self {
        let dir = TempDir::new().unwrap();
        let hosts = Arc::new(FakeHosts::new());
        let registrar = Arc::new(FakeRegistrar::default());
        let config = ManagerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dial_timeout: Duration::from_secs(1),
            registrar_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            ..ManagerConfig::default()
        };
        let manager = Arc::new(TunnelManager::new(
            config,
            mode,
            Arc::new(CertificateProvider::new(dir.path().join("certs"))),
            registrar.clone(),
            hosts.clone(),
        ));

        Self {
            dir,
            hosts,
            registrar,
            manager,
        }
    }

    fn certs_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("certs")
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn accepting(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Backend answering every request with `body`
async fn spawn_backend(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

/// Raw HTTP/1.1 GET returning the whole response text
async fn get(addr: SocketAddr, host: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_round_trip() {
    let h = Harness::dedicated();
    let backend = spawn_backend("hello from app").await;
    let port = free_port();

    h.manager
        .start("app", backend as i32, false, port as i32, 0)
        .await
        .unwrap();

    assert_eq!(
        h.manager.list().await,
        vec![TunnelSummary {
            domain: "app.local".to_string(),
            backend_port: backend,
            use_https: false,
        }]
    );
    assert!(h.hosts.maps("app.local"));
    assert_eq!(h.registrar.port_of("app.local"), Some(port));

    let response = get(SocketAddr::from(([127, 0, 0, 1], port)), "app.local").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("hello from app"));

    h.manager.stop("app.local").await.unwrap();

    assert!(h.manager.list().await.is_empty());
    assert!(!h.hosts.maps("app.local"));
    assert!(h.registrar.is_empty());
    assert!(!accepting(port).await);
}

#[tokio::test]
async fn test_duplicate_start_leaves_first_untouched() {
    let h = Harness::dedicated();
    let port = free_port();

    h.manager.start("app", 3000, false, port as i32, 0).await.unwrap();

    let err = h
        .manager
        .start("APP.local", 4000, false, free_port() as i32, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyExists(ref d) if d == "app.local"));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let list = h.manager.list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].backend_port, 3000);
    assert_eq!(h.registrar.port_of("app.local"), Some(port));
    assert!(accepting(port).await);

    h.manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_admit_one() {
    let h = Harness::dedicated();
    let port = free_port();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move {
            manager.start("race", 3000, false, port as i32, 0).await
        }));
    }

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => started += 1,
            Err(e) => assert!(matches!(e, TunnelError::AlreadyExists(_)), "{}", e),
        }
    }

    assert_eq!(started, 1);
    assert_eq!(h.manager.list().await.len(), 1);

    h.manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_discovery_failure_rolls_back_everything() {
    let h = Harness::dedicated();
    h.registrar.fail_register.store(true, Ordering::SeqCst);
    let port = free_port();

    let err = h
        .manager
        .start("app", 3000, false, port as i32, 0)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Registration);
    assert!(err.to_string().contains("discovery"));
    assert!(h.manager.list().await.is_empty());
    assert!(!h.hosts.maps("app.local"));
    assert!(!accepting(port).await);

    // The domain is free again once the failure is fixed
    h.registrar.fail_register.store(false, Ordering::SeqCst);
    h.manager.start("app", 3000, false, port as i32, 0).await.unwrap();
    h.manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_hosts_failure_closes_listener() {
    let h = Harness::dedicated();
    h.hosts.fail_update.store(true, Ordering::SeqCst);
    let port = free_port();

    let err = h
        .manager
        .start("app", 3000, false, port as i32, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::HostsUpdate { .. }));
    assert!(h.manager.list().await.is_empty());
    assert!(h.registrar.is_empty());
    assert!(!accepting(port).await);
}

#[tokio::test]
async fn test_hosts_backup_failure_aborts_start() {
    let h = Harness::dedicated();
    h.hosts.fail_backup.store(true, Ordering::SeqCst);
    let port = free_port();

    let err = h
        .manager
        .start("app", 3000, false, port as i32, 0)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("failed to back up hosts file"));
    assert_eq!(h.hosts.content(), ORIGINAL_HOSTS);
    assert!(!accepting(port).await);
}

#[tokio::test]
async fn test_stop_all_restores_hosts_byte_for_byte() {
    let h = Harness::dedicated();

    for name in ["web", "api", "docs"] {
        h.manager
            .start(name, 3000, false, free_port() as i32, 0)
            .await
            .unwrap();
    }
    assert_ne!(h.hosts.content(), ORIGINAL_HOSTS);

    // A single stop leaves the backup for the remaining tunnels
    h.manager.stop("api").await.unwrap();
    assert!(h.manager.has_hosts_backup().await);

    h.manager.stop_all().await.unwrap();

    assert!(h.manager.list().await.is_empty());
    assert!(h.registrar.is_empty());
    assert_eq!(h.hosts.content(), ORIGINAL_HOSTS);
    assert!(!h.manager.has_hosts_backup().await);
}

#[tokio::test]
async fn test_invalid_input_has_no_side_effects() {
    let h = Harness::dedicated();

    let cases = [
        ("", 3000, true, 8080, 8443),
        ("app", -1, true, 8080, 8443),
        ("app", 3000, false, 0, 0),
        ("app", 3000, true, 8080, 65536),
        ("my app", 3000, false, 8080, 0),
        ("app:1", 3000, false, 8080, 0),
        ("web:1", 3000, true, 0, 8443),
        ("a..b", 3000, false, 8080, 0),
    ];
    for (domain, backend, https, http_port, https_port) in cases {
        let err = h
            .manager
            .start(domain, backend, https, http_port, https_port)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", domain);
    }

    assert!(h.manager.list().await.is_empty());
    assert!(!h.certs_dir().exists());
    assert!(h.registrar.is_empty());
    assert_eq!(h.hosts.content(), ORIGINAL_HOSTS);
    assert!(!h.manager.has_hosts_backup().await);
}

#[tokio::test]
async fn test_stop_unknown_domain_is_not_found() {
    let h = Harness::dedicated();

    let err = h.manager.stop("nothing.local").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "tunnel for domain nothing.local does not exist");
}

#[tokio::test]
async fn test_bind_conflict_is_provisioning_error() {
    let h = Harness::dedicated();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = h
        .manager
        .start("app", 3000, false, port as i32, 0)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Listener { .. }));
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert!(h.registrar.is_empty());
    assert_eq!(h.hosts.content(), ORIGINAL_HOSTS);
}

#[tokio::test]
async fn test_https_tunnel_provisions_certificate() {
    let h = Harness::dedicated();
    let port = free_port();

    h.manager.start("secure", 3000, true, 0, port as i32).await.unwrap();

    assert!(h.certs_dir().join("secure.local.crt").exists());
    assert!(h.certs_dir().join("secure.local.key").exists());
    assert_eq!(h.registrar.port_of("secure.local"), Some(port));
    assert!(h.manager.list().await[0].use_https);
    assert!(accepting(port).await);

    h.manager.stop("secure").await.unwrap();
    assert!(!accepting(port).await);

    // Certificates outlive the tunnel
    assert!(h.certs_dir().join("secure.local.crt").exists());
}

#[tokio::test]
async fn test_corrupt_certificate_aborts_before_listener() {
    let h = Harness::dedicated();
    std::fs::create_dir_all(h.certs_dir()).unwrap();
    std::fs::write(h.certs_dir().join("bad.local.crt"), b"not a certificate").unwrap();
    std::fs::write(h.certs_dir().join("bad.local.key"), b"not a key").unwrap();
    let port = free_port();

    let err = h
        .manager
        .start("bad", 3000, true, 0, port as i32)
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("failed to ensure certificate"));
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert!(!accepting(port).await);
    assert!(h.registrar.is_empty());
    assert!(!h.manager.has_hosts_backup().await);

    // Never silently regenerated
    assert_eq!(
        std::fs::read(h.certs_dir().join("bad.local.crt")).unwrap(),
        b"not a certificate"
    );
}

#[tokio::test]
async fn test_shared_mode_routes_by_host() {
    let routes = Arc::new(RouteTable::new());
    let proxy = Arc::new(
        SharedProxy::start(
            SharedProxyConfig {
                http_addr: "127.0.0.1:0".parse().unwrap(),
                ..SharedProxyConfig::default()
            },
            routes.clone(),
        )
        .await
        .unwrap(),
    );
    let h = Harness::with_mode(ListenMode::Shared(proxy.clone()));
    let backend = spawn_backend("shared backend").await;

    h.manager
        .start("app", backend as i32, false, 80, 0)
        .await
        .unwrap();

    // Shared mode leaves the hosts file alone and advertises the shared port
    assert_eq!(h.hosts.content(), ORIGINAL_HOSTS);
    assert_eq!(h.registrar.port_of("app.local"), Some(proxy.http_addr().port()));
    assert!(routes.lookup("app").is_ok());

    for host in ["app.local", "app", "app.local:8080"] {
        let response = get(proxy.http_addr(), host).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}: {}", host, response);
        assert!(response.ends_with("shared backend"));
    }

    h.manager.stop("app").await.unwrap();
    assert!(routes.is_empty());

    let response = get(proxy.http_addr(), "app.local").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.contains("app.local"));

    proxy.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_shared_https_without_listener_fails_cleanly() {
    let routes = Arc::new(RouteTable::new());
    let proxy = Arc::new(
        SharedProxy::start(
            SharedProxyConfig {
                http_addr: "127.0.0.1:0".parse().unwrap(),
                ..SharedProxyConfig::default()
            },
            routes.clone(),
        )
        .await
        .unwrap(),
    );
    let h = Harness::with_mode(ListenMode::Shared(proxy.clone()));

    let err = h.manager.start("app", 3000, true, 80, 443).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert!(routes.is_empty());
    assert!(h.registrar.is_empty());
    assert!(h.manager.list().await.is_empty());

    proxy.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_shared_discovery_failure_removes_route_and_certificate() {
    let routes = Arc::new(RouteTable::new());
    let proxy = Arc::new(
        SharedProxy::start(
            SharedProxyConfig {
                http_addr: "127.0.0.1:0".parse().unwrap(),
                https_addr: Some("127.0.0.1:0".parse().unwrap()),
                ..SharedProxyConfig::default()
            },
            routes.clone(),
        )
        .await
        .unwrap(),
    );
    let h = Harness::with_mode(ListenMode::Shared(proxy.clone()));
    h.registrar.fail_register.store(true, Ordering::SeqCst);

    for https in [false, true] {
        let err = h
            .manager
            .start("app", 3000, https, 80, 443)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Registration, "https={}", https);
        assert!(routes.is_empty());
        assert!(!proxy.has_certificate("app.local"));
        assert!(h.manager.list().await.is_empty());
        assert!(h.registrar.is_empty());
    }

    // The route and certificate come back once discovery works
    h.registrar.fail_register.store(false, Ordering::SeqCst);
    h.manager.start("app", 3000, true, 80, 443).await.unwrap();
    assert!(routes.lookup("app.local").is_ok());
    assert!(proxy.has_certificate("app.local"));

    h.manager.stop("app").await.unwrap();
    assert!(routes.is_empty());
    assert!(!proxy.has_certificate("app.local"));

    proxy.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_second_stop_is_not_found() {
    let h = Harness::dedicated();
    let port = free_port();
    h.manager.start("app", 3000, false, port as i32, 0).await.unwrap();
    assert!(h.manager.is_running("app.local").await);

    h.manager.stop("app").await.unwrap();
    assert!(matches!(
        h.manager.stop("app").await,
        Err(TunnelError::NotFound(_))
    ));
    assert!(!h.manager.is_running("app").await);
}
