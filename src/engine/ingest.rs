// Lorekeep Runtime — Ingestion HTTP Server
//
// Loopback-only intake endpoint for browser extensions and local helper
// scripts. Raw `tokio::net::TcpListener`, no framework. Routes:
//   GET  /api/ping                          — liveness, no auth, no rate limit
//   GET  /api/intake/check?source_type&external_id — dedupe check
//   POST /api/intake                        — create an intake item
//
// Auth: bearer token, constant-time comparison, regenerated each process.
// Rate limiting: per-IP sliding window. CORS preflight answers 204 with no
// Allow-Origin header, which refuses web-origin clients by omission.

use crate::atoms::constants::{
    INTAKE_BIND_RETRIES, INTAKE_BIND_RETRY_DELAY_SECS, INTAKE_BODY_ENVELOPE_BYTES,
    INTAKE_HEADERS_TIMEOUT_SECS, INTAKE_RATE_LIMIT_MAX, INTAKE_RATE_LIMIT_WINDOW_SECS,
    INTAKE_REQUEST_TIMEOUT_SECS, MAX_INTAKE_CONTENT_BYTES,
};
use crate::atoms::error::EngineResult;
use crate::engine::events::EventBus;
use crate::engine::store::Store;
use crate::engine::types::{BusEvent, BusEventKind, IntakeSourceType};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── Rate limiter ───────────────────────────────────────────────────────────

/// Per-remote-address sliding window. Prune on access; empty lists are
/// removed to keep memory bounded.
struct RateLimiter {
    windows: parking_lot::Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn new() -> Self {
        RateLimiter { windows: parking_lot::Mutex::new(HashMap::new()) }
    }

    fn check(&self, ip: &str) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(INTAKE_RATE_LIMIT_WINDOW_SECS);
        let mut map = self.windows.lock();

        // Prune every list we touch; drop stale peers entirely.
        map.retain(|_, entries| {
            entries.retain(|t| now.duration_since(*t) < window);
            !entries.is_empty()
        });

        let entries = map.entry(ip.to_string()).or_default();
        if entries.len() >= INTAKE_RATE_LIMIT_MAX {
            return false;
        }
        entries.push(now);
        true
    }
}

// ── Token ──────────────────────────────────────────────────────────────────

/// Process-local bearer token, regenerated on each startup and held only in
/// memory.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn token_matches(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

// ── Server ─────────────────────────────────────────────────────────────────

pub struct IntakeServer {
    store: Arc<Store>,
    bus: EventBus,
    token: String,
    port: u16,
    stop: Arc<AtomicBool>,
}

impl IntakeServer {
    pub fn new(store: Arc<Store>, bus: EventBus, port: u16) -> Self {
        IntakeServer {
            store,
            bus,
            token: generate_token(),
            port,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Bind and serve. On EADDRINUSE, retry up to 3 times with a 2s delay,
    /// then disable the server — log only, never exit the process.
    /// Returns false when the server ended up disabled.
    pub async fn start(self: Arc<Self>) -> EngineResult<bool> {
        let addr = format!("127.0.0.1:{}", self.port);
        let mut listener = None;
        for attempt in 0..=INTAKE_BIND_RETRIES {
            match TcpListener::bind(&addr).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse
                    && attempt < INTAKE_BIND_RETRIES =>
                {
                    warn!(
                        "[intake] {} in use — retry {}/{} in {}s",
                        addr,
                        attempt + 1,
                        INTAKE_BIND_RETRIES,
                        INTAKE_BIND_RETRY_DELAY_SECS
                    );
                    tokio::time::sleep(Duration::from_secs(INTAKE_BIND_RETRY_DELAY_SECS)).await;
                }
                Err(e) => {
                    error!("[intake] Bind {} failed — server disabled: {}", addr, e);
                    return Ok(false);
                }
            }
        }
        let Some(listener) = listener else {
            error!("[intake] Bind {} failed after retries — server disabled", addr);
            return Ok(false);
        };

        info!("[intake] Listening on http://{}", addr);
        let rate_limiter = Arc::new(RateLimiter::new());

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                if server.stop.load(Ordering::Relaxed) {
                    break;
                }
                let accept =
                    tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
                match accept {
                    Ok(Ok((stream, peer))) => {
                        let server = server.clone();
                        let rl = rate_limiter.clone();
                        tokio::spawn(async move {
                            let peer_ip = peer.ip().to_string();
                            if let Err(e) = server.handle_connection(stream, &peer_ip, rl).await {
                                warn!("[intake] Request error from {}: {}", peer_ip, e);
                            }
                        });
                    }
                    Ok(Err(e)) => warn!("[intake] Accept error: {}", e),
                    Err(_) => { /* timeout — loop to check stop signal */ }
                }
            }
            info!("[intake] Server stopped");
        });

        Ok(true)
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_ip: &str,
        rate_limiter: Arc<RateLimiter>,
    ) -> EngineResult<()> {
        // Headers phase under its own timeout; the whole request under
        // another.
        let request = tokio::time::timeout(
            Duration::from_secs(INTAKE_REQUEST_TIMEOUT_SECS),
            read_request(&mut stream),
        )
        .await
        .map_err(|_| "request timeout")??;

        let Some(request) = request else {
            return Ok(()); // connection closed or header phase timed out
        };

        let (method, path, query) = {
            let mut parts = request.start_line.split_whitespace();
            let method = parts.next().unwrap_or("").to_string();
            let target = parts.next().unwrap_or("");
            let (path, query) = target.split_once('?').unwrap_or((target, ""));
            (method, path.to_string(), query.to_string())
        };

        // ── Liveness: no auth, no rate limit ────────────────────────────
        if method == "GET" && path == "/api/ping" {
            return send_json(&mut stream, 200, &json!({ "ok": true })).await;
        }

        // ── CORS preflight: 204, deliberately no Allow-Origin ───────────
        if method == "OPTIONS" {
            let resp = "HTTP/1.1 204 No Content\r\nAccess-Control-Allow-Methods: POST, GET, OPTIONS\r\nAccess-Control-Allow-Headers: Authorization, Content-Type\r\nConnection: close\r\n\r\n";
            stream.write_all(resp.as_bytes()).await.map_err(|e| format!("Write error: {e}"))?;
            return Ok(());
        }

        // ── Auth ────────────────────────────────────────────────────────
        let provided = request
            .headers
            .get("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .unwrap_or("");
        if !token_matches(provided, &self.token) {
            return send_json(&mut stream, 401, &json!({ "ok": false, "error": "invalid token" }))
                .await;
        }

        // ── Rate limit ──────────────────────────────────────────────────
        if !rate_limiter.check(peer_ip) {
            return send_json(&mut stream, 429, &json!({ "ok": false, "error": "rate limit exceeded" }))
                .await;
        }

        match (method.as_str(), path.as_str()) {
            ("GET", "/api/intake/check") => self.handle_check(&mut stream, &query).await,
            ("POST", "/api/intake") => self.handle_create(&mut stream, &request).await,
            _ => {
                send_json(
                    &mut stream,
                    404,
                    &json!({ "ok": false, "error": format!("not found: {method} {path}") }),
                )
                .await
            }
        }
    }

    async fn handle_check(&self, stream: &mut TcpStream, query: &str) -> EngineResult<()> {
        let params = parse_query(query);
        let source_type = params
            .get("source_type")
            .or_else(|| params.get("sourceType"))
            .and_then(|s| IntakeSourceType::parse(s));
        let external_id = params
            .get("external_id")
            .or_else(|| params.get("externalId"));
        let (Some(source_type), Some(external_id)) = (source_type, external_id) else {
            return send_json(
                stream,
                400,
                &json!({ "ok": false, "error": "source_type and external_id are required" }),
            )
            .await;
        };
        let exists = self.store.intake_item_exists(source_type, external_id)?;
        send_json(stream, 200, &json!({ "exists": exists })).await
    }

    async fn handle_create(&self, stream: &mut TcpStream, request: &Request) -> EngineResult<()> {
        let is_json = request
            .headers
            .get("content-type")
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return send_json(
                stream,
                415,
                &json!({ "ok": false, "error": "Content-Type must be application/json" }),
            )
            .await;
        }
        if request.body.len() > MAX_INTAKE_CONTENT_BYTES + INTAKE_BODY_ENVELOPE_BYTES {
            return send_json(stream, 413, &json!({ "ok": false, "error": "body too large" })).await;
        }

        let parsed: Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(e) => {
                return send_json(
                    stream,
                    400,
                    &json!({ "ok": false, "error": format!("invalid JSON body: {e}") }),
                )
                .await;
            }
        };
        let normalized = normalize_intake_body(&parsed);

        let source_type = normalized["source_type"]
            .as_str()
            .and_then(IntakeSourceType::parse);
        let external_id = normalized["external_id"].as_str().filter(|s| !s.is_empty());
        let title = normalized["title"].as_str().unwrap_or("");
        let content = normalized["content"].as_str().unwrap_or("");
        let (Some(source_type), Some(external_id)) = (source_type, external_id) else {
            return send_json(
                stream,
                400,
                &json!({ "ok": false, "error": "source_type and external_id are required" }),
            )
            .await;
        };
        if content.len() > MAX_INTAKE_CONTENT_BYTES {
            return send_json(stream, 413, &json!({ "ok": false, "error": "content too large" }))
                .await;
        }

        let id = uuid::Uuid::new_v4().to_string();
        match self.store.create_intake_item(
            &id,
            source_type,
            external_id,
            normalized["source_url"].as_str(),
            title,
            content,
            normalized["extraction_mode"].as_str(),
            normalized.get("metadata").filter(|m| !m.is_null()),
        ) {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                return send_json(
                    stream,
                    400,
                    &json!({ "ok": false, "error": "item already exists" }),
                )
                .await;
            }
            Err(e) => return Err(e),
        }

        info!("[intake] Created item {} ({} / {})", id, source_type.as_str(), external_id);
        self.bus.emit(BusEvent {
            kind: BusEventKind::IntakeCreated,
            domain_id: None, // pre-classification: wildcard for automations
            data: json!({
                "intake_id": id,
                "source_type": source_type.as_str(),
                "title": title,
                "metadata": normalized.get("metadata").cloned().unwrap_or(Value::Null),
            }),
        });

        send_json(stream, 201, &json!({ "ok": true, "id": id })).await
    }
}

// ── HTTP plumbing ──────────────────────────────────────────────────────────

struct Request {
    start_line: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Read one HTTP/1.1 request. The header phase has its own 10s timeout.
/// Returns None when the peer closes before sending a full header block.
async fn read_request(stream: &mut TcpStream) -> EngineResult<Option<Request>> {
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    // Headers, bounded in size and time.
    let header_end = loop {
        let read = tokio::time::timeout(
            Duration::from_secs(INTAKE_HEADERS_TIMEOUT_SECS),
            stream.read(&mut chunk),
        )
        .await;
        let n = match read {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(None), // headers timeout
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 64 * 1024 {
            return Err("header block too large".into());
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let start_line = lines.next().unwrap_or("").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    // Refuse absurd bodies before reading them.
    if content_length > MAX_INTAKE_CONTENT_BYTES + 64 * 1024 {
        // Drain nothing; the caller responds 413 off the oversized marker.
        return Ok(Some(Request {
            start_line,
            headers,
            body: vec![0; MAX_INTAKE_CONTENT_BYTES + INTAKE_BODY_ENVELOPE_BYTES + 1],
        }));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request { start_line, headers, body }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((
                key.to_string(),
                urlencoding::decode(value).map(|v| v.into_owned()).unwrap_or_default(),
            ))
        })
        .collect()
}

/// Accept both snake_case and camelCase keys; the canonical internal form
/// is snake_case.
fn normalize_intake_body(body: &Value) -> Value {
    let mut out = serde_json::Map::new();
    let aliases = [
        ("source_url", "sourceUrl"),
        ("extraction_mode", "extractionMode"),
        ("source_type", "sourceType"),
        ("external_id", "externalId"),
    ];
    for (snake, camel) in aliases {
        if let Some(v) = body.get(snake).or_else(|| body.get(camel)) {
            out.insert(snake.to_string(), v.clone());
        }
    }
    for key in ["title", "content", "metadata"] {
        if let Some(v) = body.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

async fn send_json(stream: &mut TcpStream, status: u16, body: &Value) -> EngineResult<()> {
    let status_text = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        _ => "Unknown",
    };
    let json = body.to_string();
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, json.len(), json
    );
    stream
        .write_all(resp.as_bytes())
        .await
        .map_err(|e| format!("Write error: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rate_limiter_allows_thirty_then_blocks() {
        let rl = RateLimiter::new();
        for _ in 0..INTAKE_RATE_LIMIT_MAX {
            assert!(rl.check("127.0.0.1"));
        }
        assert!(!rl.check("127.0.0.1"));
        assert!(rl.check("10.0.0.2")); // separate window per address
    }

    #[test]
    fn rate_limiter_drops_empty_lists() {
        let rl = RateLimiter::new();
        rl.check("127.0.0.1");
        // Force the entry to expire and touch the map again.
        {
            let mut map = rl.windows.lock();
            map.get_mut("127.0.0.1").unwrap()[0] =
                Instant::now() - Duration::from_secs(INTAKE_RATE_LIMIT_WINDOW_SECS + 1);
        }
        rl.check("10.0.0.2");
        assert!(!rl.windows.lock().contains_key("127.0.0.1"));
    }

    #[test]
    fn token_comparison_checks_length_first() {
        assert!(token_matches("abc123", "abc123"));
        assert!(!token_matches("abc12", "abc123"));
        assert!(!token_matches("abc124", "abc123"));
        assert!(!token_matches("", "abc123"));
    }

    #[test]
    fn generated_tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn body_normalization_accepts_both_key_styles() {
        let camel = json!({
            "sourceUrl": "https://example.com",
            "sourceType": "web",
            "externalId": "x1",
            "extractionMode": "readability",
            "title": "T",
            "content": "C"
        });
        let normalized = normalize_intake_body(&camel);
        assert_eq!(normalized["source_url"], "https://example.com");
        assert_eq!(normalized["source_type"], "web");
        assert_eq!(normalized["external_id"], "x1");
        assert_eq!(normalized["extraction_mode"], "readability");

        let snake = json!({ "source_type": "gmail", "external_id": "y2" });
        let normalized = normalize_intake_body(&snake);
        assert_eq!(normalized["source_type"], "gmail");
        assert_eq!(normalized["external_id"], "y2");
    }

    #[test]
    fn query_parsing_decodes_values() {
        let params = parse_query("source_type=web&external_id=a%20b");
        assert_eq!(params["source_type"], "web");
        assert_eq!(params["external_id"], "a b");
    }

    // ── End-to-end over a real loopback socket ─────────────────────────

    async fn spawn_server() -> (Arc<IntakeServer>, String, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let server = Arc::new(IntakeServer::new(store.clone(), EventBus::new(), port));
        assert!(server.clone().start().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        (server, format!("http://127.0.0.1:{port}"), store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_needs_no_auth() {
        let (server, base, _store) = spawn_server().await;
        let resp = reqwest::get(format!("{base}/api/ping")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "ok": true }));
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_requires_auth_and_json() {
        let (server, base, store) = spawn_server().await;
        let client = reqwest::Client::new();

        // No token → 401.
        let resp = client
            .post(format!("{base}/api/intake"))
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        // Wrong content type → 415.
        let resp = client
            .post(format!("{base}/api/intake"))
            .bearer_auth(server.token())
            .header("Content-Type", "text/plain")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 415);

        // Valid create → 201 with id; row exists.
        let resp = client
            .post(format!("{base}/api/intake"))
            .bearer_auth(server.token())
            .header("Content-Type", "application/json")
            .json(&json!({
                "sourceType": "web",
                "externalId": "page-1",
                "title": "A page",
                "content": "body text",
                "sourceUrl": "https://example.com/p"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], json!(true));
        let id = body["id"].as_str().unwrap();
        let item = store.get_intake_item(id).unwrap().unwrap();
        assert_eq!(item.external_id, "page-1");
        assert_eq!(item.source_type, IntakeSourceType::Web);

        // Check endpoint sees it (both key spellings).
        let resp = client
            .get(format!("{base}/api/intake/check?sourceType=web&externalId=page-1"))
            .bearer_auth(server.token())
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "exists": true }));

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_body_is_rejected_without_db_write() {
        let (server, base, store) = spawn_server().await;
        let client = reqwest::Client::new();
        let huge = "x".repeat(MAX_INTAKE_CONTENT_BYTES + 2048);
        let resp = client
            .post(format!("{base}/api/intake"))
            .bearer_auth(server.token())
            .header("Content-Type", "application/json")
            .json(&json!({
                "source_type": "web",
                "external_id": "big-1",
                "title": "big",
                "content": huge
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 413);
        assert!(!store.intake_item_exists(IntakeSourceType::Web, "big-1").unwrap());
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preflight_has_no_allow_origin() {
        let (server, base, _store) = spawn_server().await;
        let client = reqwest::Client::new();
        let resp = client
            .request(reqwest::Method::OPTIONS, format!("{base}/api/intake"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        assert!(resp.headers().get("access-control-allow-origin").is_none());
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_route_is_404() {
        let (server, base, _store) = spawn_server().await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/api/other"))
            .bearer_auth(server.token())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        server.stop();
    }
}
