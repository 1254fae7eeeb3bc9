//! Read-only HTTP introspection side-channel.
//!
//! Answers one `GET` per connection with a JSON body and closes.

use super::server::Shared;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::debug;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST: usize = 4096;

pub(crate) async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<Option<String>>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("HTTP request from {addr}");
                    tokio::spawn(respond(stream, shared.clone()));
                }
                Err(e) => {
                    debug!("HTTP accept error: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn respond(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_REQUEST];
    let mut len = 0;

    // Read until the end of the request head
    while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") && len < buf.len() {
        match time::timeout(READ_TIMEOUT, stream.read(&mut buf[len..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => len += n,
            Ok(Err(e)) => {
                debug!("HTTP read error: {e}");
                return;
            }
        }
    }

    let head = String::from_utf8_lossy(&buf[..len]);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let (status, body) = match (request_line.next(), request_line.next()) {
        (Some("GET"), Some(path)) => route(&shared, path).await,
        (Some(_), Some(_)) => (405, json!({ "error": "method-not-allowed" })),
        _ => (400, json!({ "error": "bad-request" })),
    };

    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        reason(status),
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("HTTP write error: {e}");
    }
    let _ = stream.shutdown().await;
}

async fn route(shared: &Shared, path: &str) -> (u16, Value) {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match segments.as_slice() {
        ["health"] => (
            200,
            json!({ "status": "ok", "uptimeSecs": shared.started.elapsed().as_secs() }),
        ),
        ["stats"] => (200, json!(shared.stats().await)),
        ["rooms"] => {
            let hub = shared.hub.lock().await;
            (200, json!({ "rooms": hub.registry.rooms() }))
        }
        ["rooms", room_id, "peers"] => {
            let room_id = percent_decode(room_id);
            let hub = shared.hub.lock().await;
            match hub.registry.room_peers(&room_id, Instant::now()) {
                Some(peers) => (200, json!({ "roomId": room_id, "peers": peers })),
                None => (
                    404,
                    json!({ "error": "room-not-found", "roomId": room_id }),
                ),
            }
        }
        _ => (404, json!({ "error": "not-found" })),
    }
}

/// Decode `%XX` escapes in a path segment
///
/// Malformed escapes are kept literally. A result that is not UTF-8 falls
/// back to the raw segment.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match (bytes[i], hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
            (b'%', Some(high), Some(low)) => {
                decoded.push((high << 4) | low);
                i += 3;
            }
            (byte, _, _) => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(decoded).unwrap_or_else(|_| segment.to_string())
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    let digit = char::from(*byte?).to_digit(16)?;
    u8::try_from(digit).ok()
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}
