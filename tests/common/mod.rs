//! Shared utilities for integration tests: mock backends and a proxy under test.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use myproxy::config::{ProxyConfig, RouteConfig, TunnelRouteConfig};
use myproxy::net::Listener;
use myproxy::{ExitStatus, ProxyContext, ProxyServer};

/// Echo every byte back; half-close after the client does.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// Accept connections and never answer.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// A keep-alive HTTP/1.1 backend answering every request with `body`.
pub struct HttpBackend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl HttpBackend {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub async fn start_http_backend(body: &'static str) -> HttpBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let accepted_count = accepted.clone();
    let request_count = requests.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted_count.fetch_add(1, Ordering::SeqCst);
            let request_count = request_count.clone();
            tokio::spawn(async move {
                while let Some(request) = read_http_request(&mut socket).await {
                    request_count.fetch_add(1, Ordering::SeqCst);
                    let close = request.to_ascii_lowercase().contains("connection: close");
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n{}",
                        body.len(),
                        if close { "Connection: close\r\n" } else { "" },
                        body
                    );
                    if socket.write_all(response.as_bytes()).await.is_err() || close {
                        break;
                    }
                }
            });
        }
    });

    HttpBackend {
        addr,
        accepted,
        requests,
    }
}

/// Read one request (head plus Content-Length body); `None` on EOF.
async fn read_http_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(head)
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn route(pattern: &str, target: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: None,
        pattern: pattern.into(),
        target: target.to_string(),
    }
}

pub fn tunnel_route(destination: &str, target: SocketAddr) -> TunnelRouteConfig {
    TunnelRouteConfig {
        destination: destination.into(),
        target: target.to_string(),
    }
}

/// A running proxy on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub ctx: ProxyContext,
    pub handle: JoinHandle<ExitStatus>,
}

impl TestProxy {
    /// Begin draining and wait for the server to stop.
    pub async fn stop(self) -> ExitStatus {
        self.ctx.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("proxy did not stop")
            .unwrap()
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let ctx = ProxyContext::from_config(&config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_listener(listener, config.listener.max_connections);
    let grace = Duration::from_millis(config.timeouts.shutdown_grace_ms);

    let server = ProxyServer::new(listener, ctx.clone(), grace);
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());
    TestProxy { addr, ctx, handle }
}

/// Send `request` and read until the proxy closes the connection.
pub async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    response
}

pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> String {
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
    String::from_utf8(exchange(addr, request.as_bytes()).await).unwrap()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
