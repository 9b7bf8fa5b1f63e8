//! End-to-end tests: a bound server driven over real TCP connections.

use std::net::SocketAddr;
use std::time::Duration;

use keel::{App, AppConfig, Flow, HandlerResult, ListenOptions};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), keel::ServerError>>,
}

async fn start(app: App) -> Running {
    let server = app
        .bind(ListenOptions::new("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

fn demo_app(config: AppConfig) -> App {
    let mut app = App::with_config(config);
    app.get("/hello/:name", |req, res| {
        Box::pin(async move {
            let name = req.param("name").unwrap_or_default().to_owned();
            res.send(format!("hello {name}"))?;
            Ok(Flow::Sent)
        })
    });
    app.post("/echo", |req, res| {
        Box::pin(async move {
            let body = req.body().clone();
            res.json(&body)?;
            Ok(Flow::Sent)
        })
    });
    app.get("/slow", |_req, res| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            res.send("done")?;
            Ok(Flow::Sent)
        })
    });
    app.get("/panic", |_req, _res| Box::pin(async move { explode() }));
    app
}

fn explode() -> HandlerResult {
    panic!("handler exploded")
}

/// Sends `raw` and reads until the server closes the connection.
async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8(out).unwrap()
}

/// Reads exactly one response framed by `content-length`.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return String::from_utf8(buf[..end + 4 + length].to_vec()).unwrap();
            }
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-response");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

#[tokio::test]
async fn routes_a_request_and_closes_on_request() {
    let server = start(demo_app(AppConfig::default())).await;

    let out = exchange(
        server.addr,
        "GET /hello/world HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("connection: close\r\n"));
    assert_eq!(body_of(&out), "hello world");

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_route_is_a_negotiated_404() {
    let server = start(demo_app(AppConfig::default())).await;

    let out = exchange(
        server.addr,
        "GET /nope HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    let body: Value = serde_json::from_str(body_of(&out)).unwrap();
    assert_eq!(body["error"], "Cannot GET /nope");
    assert_eq!(body["statusCode"], 404);

    let out = exchange(
        server.addr,
        "GET /nope HTTP/1.1\r\nHost: localhost\r\nAccept: text/html\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.contains("content-type: text/html"));
    assert!(body_of(&out).contains("Cannot GET /nope"));

    server.stop.send(()).unwrap();
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
    let server = start(demo_app(AppConfig::default())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET /hello/one HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let first = read_response(&mut stream).await;
    assert!(first.contains("connection: keep-alive\r\n"));
    assert_eq!(body_of(&first), "hello one");

    let payload = r#"{"n":2}"#;
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let second = read_response(&mut stream).await;
    let echoed: Value = serde_json::from_str(body_of(&second)).unwrap();
    assert_eq!(echoed, json!({ "n": 2 }));

    server.stop.send(()).unwrap();
}

#[tokio::test]
async fn head_request_keeps_length_without_body() {
    let server = start(demo_app(AppConfig::default())).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"HEAD /hello/abc HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let out = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("content-length: 9\r\n"));
    assert!(out.ends_with("\r\n\r\n"));

    server.stop.send(()).unwrap();
}

#[tokio::test]
async fn panicking_handler_answers_500_and_server_survives() {
    let server = start(demo_app(AppConfig::default())).await;

    let out = exchange(server.addr, "GET /panic HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

    let out = exchange(
        server.addr,
        "GET /hello/again HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(body_of(&out), "hello again");

    server.stop.send(()).unwrap();
}

#[tokio::test]
async fn malformed_and_oversized_requests_are_rejected() {
    let config = AppConfig {
        body_limit: 16,
        max_request_size: 1024,
        ..AppConfig::default()
    };
    let server = start(demo_app(config)).await;

    let out = exchange(server.addr, "NOT\x01HTTP\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
    assert!(out.contains("connection: close\r\n"));

    let out = exchange(
        server.addr,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 17\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");

    let out = exchange(
        server.addr,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 411 Length Required\r\n"), "{out}");

    let long_header = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n\r\n", "a".repeat(2048));
    let out = exchange(server.addr, &long_header).await;
    assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");

    server.stop.send(()).unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_requests() {
    let server = start(demo_app(AppConfig::default())).await;

    let addr = server.addr;
    let client = tokio::spawn(async move {
        exchange(addr, "GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop.send(()).unwrap();

    let out = client.await.unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body_of(&out), "done");

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
