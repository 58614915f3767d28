//! Test doubles shared by unit and integration tests: a throwaway HTTP/1.1
//! server answering canned responses by path, and a backend that never spawns.
//! Compiled for this crate's tests and behind the `testing` feature.

use crate::process::{LaunchSpec, ProcessBackend, SpawnedProcess};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a healthy worker answers on `/health`.
pub const HEALTHY_BODY: &str = r#"{"ok":true,"service":"wingman-sidecar"}"#;

#[derive(Debug, Clone)]
pub struct Route {
    pub path: &'static str,
    pub status: &'static str,
    pub content_type: &'static str,
    pub body: String,
}

impl Route {
    pub fn json(path: &'static str, status: &'static str, body: impl Into<String>) -> Self {
        Self {
            path,
            status,
            content_type: "application/json",
            body: body.into(),
        }
    }

    pub fn sse(path: &'static str, body: impl Into<String>) -> Self {
        Self {
            path,
            status: "200 OK",
            content_type: "text/event-stream",
            body: body.into(),
        }
    }
}

pub struct CannedServer {
    pub base_url: String,
    pub port: u16,
    /// Request lines ("POST /auth HTTP/1.1") and bodies, in arrival order.
    pub requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl CannedServer {
    pub fn request_lines(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }
}

/// Serves every connection from `routes` (first path match wins); unknown paths get 404.
pub async fn spawn_canned_server(routes: Vec<Route>) -> CannedServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            let seen = seen.clone();
            tokio::spawn(async move { serve_one(socket, &routes, &seen).await });
        }
    });
    CannedServer {
        base_url: format!("http://{}", addr),
        port: addr.port(),
        requests,
    }
}

async fn serve_one(
    mut socket: TcpStream,
    routes: &[Route],
    seen: &Mutex<Vec<(String, String)>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let Ok(n) = socket.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or("").to_string();
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    seen.lock().unwrap().push((request_line.clone(), body));

    let path = request_line.split_whitespace().nth(1).unwrap_or("");
    let response = match routes.iter().find(|r| r.path == path) {
        Some(route) => format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            route.status,
            route.content_type,
            route.body.len(),
            route.body
        ),
        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string(),
    };
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// A port nothing listens on (bound once, then released).
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local_addr").port()
}

/// Backend that refuses to spawn and counts how often it was asked.
#[derive(Debug, Default)]
pub struct RefusingBackend {
    spawns: AtomicUsize,
}

impl RefusingBackend {
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl ProcessBackend for RefusingBackend {
    fn spawn(&self, _spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "spawning disabled in tests",
        ))
    }

    fn terminate(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}
