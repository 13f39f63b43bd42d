// Lorekeep Runtime — OAuth Loopback Helper
//
// Authorization-code flow with PKCE against a loopback redirect. The
// callback listener accepts exactly one request, the whole flow has a
// 120s ceiling, and duplicate start calls share a single in-flight lock
// so two windows can't race the same provider.

use crate::atoms::constants::{OAUTH_FLOW_CEILING_SECS, OAUTH_PKCE_VERIFIER_BYTES, OAUTH_STATE_BYTES};
use crate::atoms::error::{EngineError, EngineResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// CSRF state: 16 random bytes, hex-encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; OAUTH_STATE_BYTES];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// PKCE verifier: 32 random bytes, base64url without padding.
pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; OAUTH_PKCE_VERIFIER_BYTES];
    getrandom::getrandom(&mut bytes).expect("getrandom");
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Code challenge: SHA-256 of the verifier, base64url without padding.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[derive(Debug)]
pub struct AuthCode {
    pub code: String,
}

/// One flow per process at a time; duplicate calls fail fast instead of
/// stealing each other's callback.
pub struct OauthFlow {
    in_flight: Arc<AtomicBool>,
}

impl Default for OauthFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl OauthFlow {
    pub fn new() -> Self {
        OauthFlow { in_flight: Arc::new(AtomicBool::new(false)) }
    }

    /// Build the authorization URL for a provider endpoint.
    pub fn authorize_url(
        &self,
        auth_endpoint: &str,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
        state: &str,
        verifier: &str,
    ) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256&access_type=offline&prompt=consent",
            auth_endpoint,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(scope),
            state,
            code_challenge(verifier),
        )
    }

    /// Listen on the loopback port for the single-use callback. Verifies
    /// the CSRF state and returns the authorization code. The 120s ceiling
    /// covers the entire wait.
    pub async fn wait_for_callback(&self, port: u16, expected_state: &str) -> EngineResult<AuthCode> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Auth("an OAuth flow is already in progress".into()));
        }
        let result = tokio::time::timeout(
            Duration::from_secs(OAUTH_FLOW_CEILING_SECS),
            accept_single_callback(port, expected_state),
        )
        .await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(EngineError::Auth("OAuth flow timed out after 120s".into())),
        }
    }
}

async fn accept_single_callback(port: u16, expected_state: &str) -> EngineResult<AuthCode> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| EngineError::Auth(format!("callback bind failed: {e}")))?;
    info!("[oauth] Waiting for callback on 127.0.0.1:{}", port);

    // Single-use: loop only past requests that are not the callback
    // (favicon fetches etc.), and consume exactly one real callback.
    loop {
        let (mut stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| EngineError::Auth(format!("callback accept failed: {e}")))?;

        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            continue;
        }
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        let first_line = request.lines().next().unwrap_or("");
        let Some(target) = first_line.split_whitespace().nth(1) else { continue };
        let Some((path, query)) = target.split_once('?') else { continue };
        if !path.starts_with("/callback") && !path.starts_with("/oauth") {
            continue;
        }

        let params: std::collections::HashMap<&str, String> = query
            .split('&')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k, urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default()))
            })
            .collect();

        let state = params.get("state").map(String::as_str).unwrap_or("");
        if state != expected_state {
            warn!("[oauth] Callback with mismatched state — rejecting");
            respond(&mut stream, 400, "State mismatch. Close this window and retry.").await;
            return Err(EngineError::Auth("OAuth state mismatch".into()));
        }

        if let Some(error) = params.get("error") {
            respond(&mut stream, 400, "Authorization was denied.").await;
            return Err(EngineError::Auth(format!("authorization denied: {error}")));
        }

        let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
            respond(&mut stream, 400, "Missing authorization code.").await;
            return Err(EngineError::Auth("callback without authorization code".into()));
        };

        respond(&mut stream, 200, "Authorization complete. You can close this window.").await;
        return Ok(AuthCode { code: code.clone() });
    }
}

async fn respond(stream: &mut tokio::net::TcpStream, status: u16, message: &str) {
    let status_text = if status == 200 { "OK" } else { "Bad Request" };
    let body = format!("<html><body><p>{message}</p></body></html>");
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, body.len(), body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_sixteen_bytes_hex() {
        let state = generate_state();
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_state(), state);
    }

    #[test]
    fn verifier_is_base64url_of_32_bytes() {
        let verifier = generate_pkce_verifier();
        let decoded = URL_SAFE_NO_PAD.decode(&verifier).unwrap();
        assert_eq!(decoded.len(), 32);
        assert!(!verifier.contains('='));
        assert!(!verifier.contains('+'));
        assert!(!verifier.contains('/'));
    }

    #[test]
    fn challenge_matches_rfc7636_vector() {
        // RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(code_challenge(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn authorize_url_carries_pkce_params() {
        let flow = OauthFlow::new();
        let url = flow.authorize_url(
            "https://accounts.example.com/o/oauth2/auth",
            "client-1",
            "http://127.0.0.1:9099/callback",
            "mail.compose",
            "statestate",
            "verifierverifier",
        );
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=statestate"));
        assert!(url.contains(&format!("code_challenge={}", code_challenge("verifierverifier"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callback_round_trip_and_single_in_flight() {
        let flow = Arc::new(OauthFlow::new());
        let state = generate_state();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let waiter = {
            let flow = flow.clone();
            let state = state.clone();
            tokio::spawn(async move { flow.wait_for_callback(port, &state).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A second start while one is in flight fails fast.
        let err = flow.wait_for_callback(port, "other").await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));

        // Deliver the callback.
        let resp = reqwest::get(format!(
            "http://127.0.0.1:{port}/callback?code=authcode-1&state={state}"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);

        let code = waiter.await.unwrap().unwrap();
        assert_eq!(code.code, "authcode-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_mismatch_is_rejected() {
        let flow = OauthFlow::new();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let waiter = tokio::spawn(async move { flow.wait_for_callback(port, "expected").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = reqwest::get(format!(
            "http://127.0.0.1:{port}/callback?code=c&state=forged"
        ))
        .await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Auth(_))));
    }
}
