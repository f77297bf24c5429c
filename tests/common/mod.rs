//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tenant_gateway::config::{BackendConfig, GatewayConfig, RouteConfig};
use tenant_gateway::http::AppState;
use tenant_gateway::lifecycle::{Gateway, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const USER_HEADER: &str = "x-user-id";
pub const TENANT_HEADER: &str = "x-tenant-id";

/// A mock backend on an ephemeral port that records every request head.
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Request heads received so far, oldest first.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

/// Start a backend that returns a fixed JSON response.
pub async fn start_mock_backend(status: u16, body: &'static str) -> MockBackend {
    start_programmable_backend(move |_| async move { (status, body.to_string()) }).await
}

/// Start a programmable backend. The handler gets the request head
/// (request line and headers) and returns status and JSON body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let (task_hits, task_requests) = (hits.clone(), requests.clone());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let f = f.clone();
            let hits = task_hits.clone();
            let requests = task_requests.clone();
            tokio::spawn(async move {
                serve_one(socket, f, hits, requests).await;
            });
        }
    });

    MockBackend { addr, hits, requests }
}

async fn serve_one<F, Fut>(
    mut socket: TcpStream,
    f: Arc<F>,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) where
    F: Fn(String) -> Fut,
    Fut: Future<Output = (u16, String)>,
{
    let head = match read_head(&mut socket).await {
        Some(head) => head,
        None => return,
    };
    hits.fetch_add(1, Ordering::SeqCst);
    requests.lock().push(head.clone());

    let (status, body) = f(head).await;
    let response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Read up to the blank line ending the request head, then drain a
/// `Content-Length` body so the client sees a clean exchange.
async fn read_head(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..end]).into_owned();

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(buf.len() - end);
    while remaining > 0 {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
    Some(head)
}

pub fn backend(name: &str, url: &str) -> BackendConfig {
    BackendConfig {
        name: name.into(),
        base_url: url.into(),
        timeout_ms: None,
        circuit_breaker: None,
    }
}

pub fn route(name: &str, prefix: &str, backend: &str) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        path_prefix: prefix.into(),
        methods: vec![],
        backend: backend.into(),
        strip_prefix: true,
        rate_class: None,
        cache_ttl_secs: None,
        cache_tags: vec![],
        invalidate_tags: vec![],
        notify_topic: None,
        notify_event: None,
        timeout_ms: None,
        priority: 0,
    }
}

/// Defaults with metrics off, suitable for many gateways in one process.
pub fn base_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.observability.metrics_enabled = false;
    config.listener.bind_address = "127.0.0.1:0".into();
    config
}

/// A gateway serving on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Arc<Shutdown>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws{}", self.addr, query)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    let gateway = Gateway::build(config).unwrap();
    let state = gateway.state().clone();
    let shutdown = gateway.shutdown_handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = gateway.serve(listener).await;
    });
    wait_for_port(addr).await;

    TestGateway { addr, state, shutdown }
}

pub async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {}", addr);
}

/// Client pre-loaded with identity headers for `user` in `tenant`.
pub fn client_for(user: &str, tenant: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(USER_HEADER, user.parse().unwrap());
    headers.insert(TENANT_HEADER, tenant.parse().unwrap());
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .unwrap()
}
