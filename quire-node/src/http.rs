//! Discovery endpoints served on the node's single port.
//!
//! | Method/Path      | Body                                  |
//! |------------------|---------------------------------------|
//! | `GET /uptime`    | `{id, uptime}`                        |
//! | `GET /health`    | `{status, role, main}`                |
//! | `GET /state`     | `{document, cursors}`                 |
//! | `GET /election`  | runs a round, then `{role, main}`     |
//!
//! Only the request head is looked at; bodies are never read. Every response
//! is JSON, carries a permissive CORS header and closes the connection.

use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::election::Elector;
use crate::store::SharedStore;

/// Largest request head accepted.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Method, target and headers of an HTTP/1.1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Bytes up to and including the blank line
    pub len: usize,
}

impl RequestHead {
    /// Parse a complete head out of `buf`. `None` until the blank line
    /// has arrived or when the request line is unusable.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let end = head_end(buf)?;
        let text = std::str::from_utf8(&buf[..end]).ok()?;
        let mut lines = text.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?;
        let path = target.split('?').next().unwrap_or(target).to_string();

        let headers = lines
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();

        Some(Self {
            method,
            path,
            headers,
            len: end + HEAD_TERMINATOR.len(),
        })
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.to_ascii_lowercase().contains("websocket"))
    }
}

/// Offset of the blank line ending the head, if present.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Wait until a full request head is buffered on `stream` without consuming it.
///
/// The WebSocket handshake needs the same bytes afterwards, so the head is
/// only peeked at.
pub async fn peek_head(stream: &TcpStream, limit: Duration) -> std::io::Result<RequestHead> {
    let peek = async {
        let mut buf = vec![0u8; MAX_HEAD_BYTES];
        let mut seen = 0;
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before request head",
                ));
            }
            if let Some(head) = RequestHead::parse(&buf[..n]) {
                return Ok(head);
            }
            if head_end(&buf[..n]).is_some() || n == buf.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unusable request head",
                ));
            }
            if n == seen {
                // peek returns at once while unread bytes exist
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            seen = n;
        }
    };
    match tokio::time::timeout(limit, peek).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "request head not received in time",
        )),
    }
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Uptime,
    Health,
    State,
    Election,
    Preflight,
    MethodNotAllowed,
    NotFound,
}

pub fn route(method: &str, path: &str) -> Route {
    match method {
        "OPTIONS" => return Route::Preflight,
        "GET" => {}
        _ => return Route::MethodNotAllowed,
    }
    match path {
        "/uptime" => Route::Uptime,
        "/health" => Route::Health,
        "/state" => Route::State,
        "/election" => Route::Election,
        _ => Route::NotFound,
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status: 200, body },
            Err(e) => {
                log::error!("Failed to serialize response body: {e}");
                Self::error(500, "internal error")
            }
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, OPTIONS\r\n\
             Access-Control-Allow-Headers: *\r\n\
             Connection: close\r\n",
            self.status,
            reason(self.status)
        );
        if self.status != 204 {
            out.push_str(&format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n",
                self.body.len()
            ));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

/// Build the response for `route`.
pub async fn respond(route: Route, elector: &Elector, store: &SharedStore) -> HttpResponse {
    match route {
        Route::Uptime => HttpResponse::json(&elector.uptime_report()),
        Route::Health => HttpResponse::json(&elector.health_report()),
        Route::State => {
            let snapshot = store.read().await.snapshot();
            HttpResponse::json(&snapshot)
        }
        Route::Election => {
            elector.run_round().await;
            HttpResponse::json(&elector.election_report())
        }
        Route::Preflight => HttpResponse::no_content(),
        Route::MethodNotAllowed => HttpResponse::error(405, "method not allowed"),
        Route::NotFound => HttpResponse::error(404, "not found"),
    }
}

/// Answer one plain HTTP request whose head was already peeked.
pub async fn serve(
    mut stream: TcpStream,
    head: RequestHead,
    elector: &Elector,
    store: &SharedStore,
) -> std::io::Result<()> {
    let mut consumed = vec![0u8; head.len];
    stream.read_exact(&mut consumed).await?;

    let route = route(&head.method, &head.path);
    log::trace!("HTTP {} {} -> {:?}", head.method, head.path, route);
    let response = respond(route, elector, store).await;

    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
