//! End-to-end tests: real sockets through a running proxy.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use myproxy::config::ProxyConfig;
use myproxy::framer::FramerMode;
use myproxy::pool::ExhaustedPolicy;
use myproxy::ExitStatus;

mod common;

use common::*;

#[tokio::test]
async fn http_requests_follow_longest_prefix() {
    let api = start_http_backend("api").await;
    let static_files = start_http_backend("static").await;
    let fallback = start_http_backend("fallback").await;

    let mut config = ProxyConfig::default();
    config.routes = vec![
        route("*", fallback.addr),
        route("/api/*", api.addr),
        route("example.com/static/", static_files.addr),
    ];
    let proxy = start_proxy(config).await;

    let response = http_get(proxy.addr, "a", "/api/users").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("api"));

    let response = http_get(proxy.addr, "example.com:3000", "/static/app.js").await;
    assert!(response.ends_with("static"));

    let response = http_get(proxy.addr, "other.com", "/static/app.js").await;
    assert!(response.ends_with("fallback"));

    assert_eq!(proxy.stop().await, ExitStatus::Clean);
}

#[tokio::test]
async fn unknown_path_gets_404() {
    let api = start_http_backend("api").await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/api/*", api.addr)];
    let proxy = start_proxy(config).await;

    let response = http_get(proxy.addr, "a", "/unknown").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert_eq!(api.accepted(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_gets_502() {
    let dead = closed_port().await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", dead)];
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", dead)];
    config.timeouts.connect_ms = 500;
    let proxy = start_proxy(config).await;

    let response = http_get(proxy.addr, "a", "/").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);

    let response = exchange(proxy.addr, b"db.internal:5432\r\n").await;
    assert_eq!(response, b"ERR upstream-unavailable\r\n");

    proxy.stop().await;
}

#[tokio::test]
async fn unknown_tunnel_destination_is_refused() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    let proxy = start_proxy(config).await;

    let response = exchange(proxy.addr, b"cache.internal:6379\r\nPING").await;
    assert_eq!(response, b"ERR no-route\r\n");

    proxy.stop().await;
}

#[tokio::test]
async fn oversized_head_gets_431() {
    let api = start_http_backend("api").await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", api.addr)];
    config.framer.max_header_bytes = 128;
    let proxy = start_proxy(config).await;

    let request = format!("GET / HTTP/1.1\r\nHost: a\r\nX-Padding: {}\r\n\r\n", "x".repeat(256));
    let response = String::from_utf8(exchange(proxy.addr, request.as_bytes()).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 431 "), "{}", response);

    proxy.stop().await;
}

#[tokio::test]
async fn tunnel_preserves_every_byte() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    let proxy = start_proxy(config).await;

    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let sent = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(b"db.internal:5432\r\n").await.unwrap();
        writer.write_all(&sent).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    writer_task.await.unwrap();

    assert_eq!(received.len(), payload.len());
    assert!(received == payload);

    assert_eq!(proxy.stop().await, ExitStatus::Clean);
}

#[tokio::test]
async fn keep_alive_upstream_is_reused_across_clients() {
    let backend = start_http_backend("pong").await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", backend.addr)];
    let proxy = start_proxy(config).await;

    let first = http_get(proxy.addr, "a", "/ping").await;
    let second = http_get(proxy.addr, "a", "/ping").await;
    assert!(first.ends_with("pong"));
    assert!(second.ends_with("pong"));

    assert_eq!(backend.requests(), 2);
    assert_eq!(backend.accepted(), 1);

    let stats = proxy.ctx.pool.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].idle, 1);
    assert_eq!(stats[0].leased, 0);

    proxy.stop().await;
}

#[tokio::test]
async fn connection_close_request_is_not_pooled() {
    let backend = start_http_backend("pong").await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", backend.addr)];
    let proxy = start_proxy(config).await;

    let request = b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
    exchange(proxy.addr, request).await;
    exchange(proxy.addr, request).await;

    assert_eq!(backend.accepted(), 2);
    assert!(proxy.ctx.pool.stats().is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn pool_cap_fails_fast_when_exhausted() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    config.pool.max_conn_per_target = 1;
    config.pool.exhausted_policy = ExhaustedPolicy::FailFast;
    let proxy = start_proxy(config).await;

    let mut holder = TcpStream::connect(proxy.addr).await.unwrap();
    holder.write_all(b"db.internal:5432\r\nhello").await.unwrap();
    let mut echoed = [0u8; 5];
    holder.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    let ctx = proxy.ctx.clone();
    assert!(eventually(|| ctx.pool.stats().first().map(|s| s.leased) == Some(1)).await);

    let response = exchange(proxy.addr, b"db.internal:5432\r\n").await;
    assert_eq!(response, b"ERR pool-exhausted\r\n");

    let stats = proxy.ctx.pool.stats();
    assert!(stats[0].live <= 1);

    drop(holder);
    proxy.stop().await;
}

#[tokio::test]
async fn pool_cap_waiter_proceeds_after_release() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    config.pool.max_conn_per_target = 1;
    config.pool.exhausted_policy = ExhaustedPolicy::Wait;
    config.pool.lease_wait_ms = 5000;
    let proxy = start_proxy(config).await;

    let mut holder = TcpStream::connect(proxy.addr).await.unwrap();
    holder.write_all(b"db.internal:5432\r\n").await.unwrap();
    let ctx = proxy.ctx.clone();
    assert!(eventually(|| ctx.pool.stats().first().map(|s| s.leased) == Some(1)).await);

    let mut waiter = TcpStream::connect(proxy.addr).await.unwrap();
    waiter.write_all(b"db.internal:5432\r\nsecond").await.unwrap();
    waiter.shutdown().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    holder.shutdown().await.unwrap();
    let mut rest = Vec::new();
    holder.read_to_end(&mut rest).await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), waiter.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"second");

    proxy.stop().await;
}

#[tokio::test]
async fn idle_relay_is_closed() {
    let silent = start_silent_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", silent)];
    config.timeouts.idle_ms = 200;
    let proxy = start_proxy(config).await;

    let started = Instant::now();
    let response = exchange(proxy.addr, b"db.internal:5432\r\n").await;
    assert!(response.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(3));

    proxy.stop().await;
}

#[tokio::test]
async fn tunnel_only_mode_rejects_http_as_destination() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.listener.mode = FramerMode::Tunnel;
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    let proxy = start_proxy(config).await;

    let response = exchange(proxy.addr, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.starts_with(b"ERR "), "{:?}", String::from_utf8_lossy(&response));

    proxy.stop().await;
}

#[tokio::test]
async fn reload_is_visible_to_new_connections() {
    let old = start_http_backend("old").await;
    let new = start_http_backend("new").await;

    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", old.addr)];
    let proxy = start_proxy(config.clone()).await;
    assert!(http_get(proxy.addr, "a", "/").await.ends_with("old"));

    config.routes = vec![route("/", new.addr)];
    assert_eq!(proxy.ctx.store.replace(&config).unwrap(), 2);
    assert!(http_get(proxy.addr, "a", "/").await.ends_with("new"));

    proxy.stop().await;
}

#[tokio::test]
async fn drain_lets_in_flight_exchange_finish() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    config.timeouts.shutdown_grace_ms = 5000;
    let proxy = start_proxy(config).await;
    let addr = proxy.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"db.internal:5432\r\nbefore").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();

    proxy.ctx.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());

    client.write_all(b"after").await.unwrap();
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"after");

    assert_eq!(proxy.stop().await, ExitStatus::Clean);
}

#[tokio::test]
async fn grace_expiry_forces_shutdown() {
    let silent = start_silent_backend().await;
    let mut config = ProxyConfig::default();
    config.routes = vec![route("/", silent)];
    config.timeouts.shutdown_grace_ms = 100;
    let proxy = start_proxy(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let ctx = proxy.ctx.clone();
    assert!(eventually(|| ctx.pool.stats().first().map(|s| s.leased) == Some(1)).await);

    let started = Instant::now();
    assert_eq!(proxy.stop().await, ExitStatus::Forced);
    assert!(started.elapsed() < Duration::from_secs(3));

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn drain_finishes_some_relays_and_forces_the_rest() {
    let echo = start_echo_backend().await;
    let mut config = ProxyConfig::default();
    config.tunnel.routes = vec![tunnel_route("db.internal:5432", echo)];
    config.timeouts.shutdown_grace_ms = 500;
    let proxy = start_proxy(config).await;

    let mut clients = Vec::new();
    for i in 0..10 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let hello = format!("db.internal:5432\r\nhello-{}", i);
        client.write_all(hello.as_bytes()).await.unwrap();
        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..], format!("hello-{}", i).as_bytes());
        clients.push(client);
    }
    let ctx = proxy.ctx.clone();
    assert_eq!(ctx.tracker.active_count(), 10);

    ctx.shutdown.trigger();
    let (finishing, stuck) = clients.split_at_mut(5);
    for client in finishing.iter_mut() {
        client.write_all(b"after").await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"after");
    }

    let started = Instant::now();
    assert_eq!(proxy.stop().await, ExitStatus::Forced);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(ctx.tracker.active_count(), 0);

    for client in stuck.iter_mut() {
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
