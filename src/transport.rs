//! HTTP transport wrapper (spec ref: §4.2 Transport).
//!
//! Grounded in `pyicloud_ipd/session.py::PyiCloudSession.request`: every
//! response is scanned for the `HEADER_DATA` headers and any `Set-Cookie`
//! values, both are persisted to disk before the caller sees the body, and
//! JSON error envelopes (`hasError`/`service_errors`, or `success: false`
//! with `errorMessage`/`errorCode`) are normalized into a typed error. The
//! retry-with-backoff loop reuses the teacher's `upload.rs` `AttemptError`
//! idiom, extended to treat Apple's session-expiry signal as a caller-visible
//! condition rather than a retryable one.

use crate::error::{ConnectionError, SyncError};
use crate::session::{CookieJar, Session, SessionStore, HEADER_DATA};
use anyhow::Result;
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const MAX_ATTEMPTS: usize = 5;
const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 20_000;

/// Re-auth callback type (Design Note "Cyclic references"): `Transport` is
/// constructed before the `Authenticator` that will eventually supply this,
/// so it's threaded in after the fact via `set_reauth_callback` rather than
/// Transport holding a direct reference to the Authenticator.
pub type ReauthCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct AttemptError {
    error: SyncError,
    retryable: bool,
}

impl AttemptError {
    fn fatal(error: SyncError) -> Self {
        Self { error, retryable: false }
    }

    fn retryable(error: SyncError) -> Self {
        Self { error, retryable: true }
    }
}

/// Shared, clonable handle over one iCloud HTTP session. Every call site
/// (auth, photo listing, download) goes through the same instance so that
/// header-derived session state stays consistent and every response gets
/// persisted.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    state: Arc<Mutex<(Session, CookieJar)>>,
    store: Arc<SessionStore>,
    account_name: String,
    http_timeout: Duration,
    reauth: Arc<Mutex<Option<ReauthCallback>>>,
}

pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl Transport {
    pub fn new(
        client: Client,
        store: Arc<SessionStore>,
        account_name: String,
        session: Session,
        jar: CookieJar,
        http_timeout: Duration,
    ) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new((session, jar))),
            store,
            account_name,
            http_timeout,
            reauth: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session_snapshot(&self) -> Session {
        self.state.lock().0.clone()
    }

    pub fn client_id(&self) -> String {
        self.state.lock().0.client_id.clone()
    }

    /// Wires the re-auth callback in after construction, breaking the
    /// Session/Authenticator/Transport cycle (spec ref: §9 Design Notes).
    pub fn set_reauth_callback(&self, callback: ReauthCallback) {
        *self.reauth.lock() = Some(callback);
    }

    /// Invokes the re-auth callback if one is wired, otherwise a no-op.
    /// Called by `request_json`'s retry loop on "Invalid global session"
    /// before the caller's next attempt (spec ref: §4.3 Transport,
    /// "Detect session expiration").
    async fn reauthenticate(&self) -> Result<()> {
        let callback = self.reauth.lock().clone();
        match callback {
            Some(callback) => callback().await,
            None => Ok(()),
        }
    }

    /// Sends one request, retrying transport-level failures and 5xx/429
    /// responses with exponential backoff. Any well-formed JSON error
    /// envelope is surfaced immediately (not retried) as a typed
    /// `SyncError::Api`, since the original never retries those.
    pub async fn request_json(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        extra_headers: &[(&str, String)],
    ) -> std::result::Result<JsonResponse, SyncError> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        let mut last_err: Option<SyncError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_once(method.clone(), url, body, extra_headers).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let attempts_left = MAX_ATTEMPTS - attempt - 1;
                    if err.error.is_session_expired() && attempts_left > 0 {
                        tracing::error!(url, "session error, re-authenticating before retry");
                        if let Err(reauth_err) = self.reauthenticate().await {
                            tracing::error!(error = %reauth_err, "re-authentication failed");
                            return Err(err.error);
                        }
                        last_err = Some(err.error);
                        continue;
                    }
                    if err.retryable && attempts_left > 0 {
                        tracing::warn!(url, attempt = attempt + 1, error = %err.error, "request failed, retrying");
                        sleep(delay).await;
                        delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_DELAY_MS));
                        last_err = Some(err.error);
                        continue;
                    }
                    return Err(err.error);
                }
            }
        }
        Err(last_err.unwrap_or(SyncError::Connection(ConnectionError::Timeout)))
    }

    async fn try_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        extra_headers: &[(&str, String)],
    ) -> std::result::Result<JsonResponse, AttemptError> {
        let cookie_header = self.state.lock().1.header_value();

        let mut req = self.client.request(method, url).timeout(self.http_timeout);
        if let Some(body) = body {
            req = req.json(body);
        }
        for (name, value) in extra_headers {
            req = req.header(*name, value.as_str());
        }
        if let Some(cookie_header) = cookie_header {
            req = req.header(reqwest::header::COOKIE, cookie_header);
        }

        let response = req.send().await;
        let response = match response {
            Ok(resp) => resp,
            Err(err) => {
                if err.is_timeout() || err.is_connect() {
                    return Err(AttemptError::retryable(SyncError::Connection(ConnectionError::Request(err))));
                }
                return Err(AttemptError::fatal(SyncError::Connection(ConnectionError::Request(err))));
            }
        };

        let status = response.status();
        self.absorb_headers(&response);

        for raw in response.headers().get_all(reqwest::header::SET_COOKIE) {
            if let Ok(text) = raw.to_str() {
                self.state.lock().1.apply_set_cookie(text);
            }
        }
        self.persist();

        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::retryable(SyncError::Api {
                code: status.as_str().to_string(),
                reason: "service temporarily unavailable".to_string(),
            }));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        let is_json = content_type == "application/json" || content_type == "text/json";

        if !status.is_success() && (!is_json || matches!(status.as_u16(), 421 | 450 | 500)) {
            return Err(AttemptError::fatal(SyncError::Api {
                code: status.as_str().to_string(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            }));
        }

        if !is_json {
            if self.state.lock().0.apple_rscd.as_deref() == Some("401") {
                return Err(AttemptError::fatal(SyncError::FailedLogin));
            }
            return Ok(JsonResponse { status, body: Value::Null });
        }

        let body: Value = if status == StatusCode::NO_CONTENT {
            Value::Object(Default::default())
        } else {
            match response.json().await {
                Ok(value) => value,
                Err(_) => return Ok(JsonResponse { status, body: Value::Null }),
            }
        };

        if let Some(err) = classify_json_error(&body) {
            return Err(AttemptError::fatal(err));
        }

        Ok(JsonResponse { status, body })
    }

    /// Issues a GET and returns the live response for the caller to stream,
    /// instead of buffering it as JSON. Still applies cookie/header
    /// bookkeeping and the same connection-level retry policy as
    /// `request_json`; a non-2xx/206 status is treated as a fatal API error
    /// since asset download URLs don't carry structured JSON error bodies.
    pub async fn get_stream(&self, url: &str, extra_headers: &[(&str, String)]) -> std::result::Result<reqwest::Response, SyncError> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        for attempt in 0..MAX_ATTEMPTS {
            let cookie_header = self.state.lock().1.header_value();
            let mut req = self.client.get(url).timeout(self.http_timeout);
            for (name, value) in extra_headers {
                req = req.header(*name, value.as_str());
            }
            if let Some(cookie_header) = &cookie_header {
                req = req.header(reqwest::header::COOKIE, cookie_header.as_str());
            }

            match req.send().await {
                Ok(response) => {
                    self.absorb_headers(&response);
                    self.persist();
                    let status = response.status();
                    if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
                        return Ok(response);
                    }
                    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
                        if attempt + 1 < MAX_ATTEMPTS {
                            sleep(delay).await;
                            delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_DELAY_MS));
                            continue;
                        }
                    }
                    return Err(SyncError::Api {
                        code: status.as_str().to_string(),
                        reason: status.canonical_reason().unwrap_or("unknown").to_string(),
                    });
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < MAX_ATTEMPTS {
                        sleep(delay).await;
                        delay = std::cmp::min(delay * 2, Duration::from_millis(MAX_DELAY_MS));
                        continue;
                    }
                    return Err(SyncError::Connection(ConnectionError::Request(err)));
                }
            }
        }
        Err(SyncError::Connection(ConnectionError::Timeout))
    }

    fn absorb_headers(&self, response: &reqwest::Response) {
        let mut guard = self.state.lock();
        for (header_name, field) in HEADER_DATA {
            if let Some(value) = response.headers().get(*header_name).and_then(|v| v.to_str().ok()) {
                guard.0.set_field(*field, value.to_string());
            }
        }
    }

    fn persist(&self) {
        let guard = self.state.lock();
        if let Err(err) = self.store.save(&self.account_name, &guard.0, &guard.1) {
            tracing::warn!(error = %err, "failed to persist session to disk");
        }
    }
}

/// Mirrors `PyiCloudSession._raise_error`'s envelope inspection: a
/// `hasError`/`service_errors` shape takes priority, otherwise an explicit
/// `success: false` is checked against several historically-seen reason/code
/// field names.
fn classify_json_error(body: &Value) -> Option<SyncError> {
    let obj = body.as_object()?;

    if obj.get("hasError").and_then(Value::as_bool) == Some(true) {
        let (code, reason) = obj
            .get("service_errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .map(|first| {
                (
                    first.get("code").and_then(Value::as_str).unwrap_or("Unknown").to_string(),
                    first.get("message").and_then(Value::as_str).unwrap_or("Unknown").to_string(),
                )
            })
            .unwrap_or_else(|| ("Unknown".to_string(), "Unknown".to_string()));
        return Some(map_error(code, reason));
    }

    if obj.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = obj
            .get("errorMessage")
            .or_else(|| obj.get("reason"))
            .or_else(|| obj.get("errorReason"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| obj.get("error").and_then(Value::as_str).map(str::to_string));
        let code = obj
            .get("errorCode")
            .or_else(|| obj.get("serverErrorCode"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| obj.get("error").and_then(Value::as_str).map(str::to_string));
        if let Some(reason) = reason {
            return Some(map_error(code.unwrap_or_else(|| "Unknown".to_string()), reason));
        }
    }

    None
}

fn map_error(code: String, reason: String) -> SyncError {
    if code == "ZONE_NOT_FOUND" || code == "AUTHENTICATION_FAILED" {
        return SyncError::ServiceNotActivated;
    }
    if matches!(code.as_str(), "421" | "450" | "500") {
        return SyncError::Api { code, reason: "Authentication required for Account.".to_string() };
    }
    if code == "ACCESS_DENIED" {
        return SyncError::Api {
            code,
            reason: format!("{reason}. Please wait a few minutes then try again."),
        };
    }
    SyncError::Api { code, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_has_error_envelope() {
        let body = json!({
            "hasError": true,
            "service_errors": [{"code": "ACCESS_DENIED", "message": "nope"}],
        });
        let err = classify_json_error(&body).unwrap();
        assert!(err.is_access_denied());
    }

    #[test]
    fn classifies_zone_not_found_as_service_not_activated() {
        let body = json!({"success": false, "errorCode": "ZONE_NOT_FOUND", "errorMessage": "missing"});
        let err = classify_json_error(&body).unwrap();
        assert!(matches!(err, SyncError::ServiceNotActivated));
    }

    #[test]
    fn success_true_has_no_error() {
        let body = json!({"success": true});
        assert!(classify_json_error(&body).is_none());
    }

    #[test]
    fn missing_reason_on_failure_is_not_classified() {
        let body = json!({"success": false});
        assert!(classify_json_error(&body).is_none());
    }
}
