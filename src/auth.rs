//! Authenticator (spec ref: §4.2 Authenticator).
//!
//! Grounded in `pyicloud_ipd/base.py::authenticate`/`_authenticate_srp`/
//! `_authenticate_raw_password`/`_authenticate_with_token`, and in
//! `icloudpd/authentication.py::authenticator`'s MFA dispatch. The
//! three-tier login order (cached session token -> SRP -> raw password
//! fallback) and the fixed OAuth header set are carried over unchanged;
//! only the two-step/1FA legacy device-trust flow is out of scope (spec
//! Non-goals exclude `hsaVersion` 1 accounts).

use crate::error::SyncError;
use crate::session::{CookieJar, Session, SessionStore};
use crate::srp::{derive_password_key, S2kProtocol, SrpClient};
use crate::status::{Status, StatusExchange};
use crate::transport::Transport;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const OAUTH_CLIENT_ID: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Com,
    Cn,
}

impl Domain {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "com" => Ok(Self::Com),
            "cn" => Ok(Self::Cn),
            other => anyhow::bail!("domain '{other}' is not supported yet"),
        }
    }

    pub fn auth_endpoint(self) -> &'static str {
        match self {
            Self::Com => "https://idmsa.apple.com/appleauth/auth",
            Self::Cn => "https://idmsa.apple.com.cn/appleauth/auth",
        }
    }

    pub fn home_endpoint(self) -> &'static str {
        match self {
            Self::Com => "https://www.icloud.com",
            Self::Cn => "https://www.icloud.com.cn",
        }
    }

    pub fn setup_endpoint(self) -> &'static str {
        match self {
            Self::Com => "https://setup.icloud.com/setup/ws/1",
            Self::Cn => "https://setup.icloud.com.cn/setup/ws/1",
        }
    }
}

/// How an interactive MFA code gets from the operator to the auth flow.
pub enum MfaProvider {
    /// Blocks on stdin, mirroring `request_2fa`'s console prompt.
    Interactive,
    /// Blocks on the `StatusExchange`, driven by the embedded control
    /// server's `/mfa` endpoint, mirroring `request_2fa_web`.
    WebUi(StatusExchange),
}

pub struct Authenticator {
    transport: Transport,
    domain: Domain,
    account_name: String,
    password: String,
}

/// Mirrors `AuthenticatorResult`'s success/failure shape, minus the
/// service-handle payload (callers hold the `Authenticator`/`Transport`
/// directly instead of a returned service object).
pub enum AuthOutcome {
    Success { data: Value },
    MfaRequired,
}

impl Authenticator {
    pub fn new(
        client: Client,
        store: Arc<SessionStore>,
        domain: Domain,
        account_name: String,
        password: String,
        client_id_override: Option<String>,
        http_timeout: Duration,
    ) -> Self {
        let (session, jar) = store.load(&account_name, client_id_override);
        let transport = Transport::new(client, store, account_name.clone(), session, jar, http_timeout);
        Self { transport, domain, account_name, password }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn auth_headers(&self, overrides: &[(&str, String)]) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Accept", "application/json, text/javascript".to_string()),
            ("Content-Type", "application/json".to_string()),
            ("X-Apple-OAuth-Client-Id", OAUTH_CLIENT_ID.to_string()),
            ("X-Apple-OAuth-Client-Type", "firstPartyAuth".to_string()),
            ("X-Apple-OAuth-Redirect-URI", self.domain.home_endpoint().to_string()),
            ("X-Apple-OAuth-Require-Grant-Code", "true".to_string()),
            ("X-Apple-OAuth-Response-Mode", "web_message".to_string()),
            ("X-Apple-OAuth-Response-Type", "code".to_string()),
            ("X-Apple-OAuth-State", self.transport.client_id()),
            ("X-Apple-Widget-Key", OAUTH_CLIENT_ID.to_string()),
        ];
        let session = self.transport.session_snapshot();
        if let Some(scnt) = session.scnt {
            headers.push(("scnt", scnt));
        }
        if let Some(session_id) = session.session_id {
            headers.push(("X-Apple-ID-Session-Id", session_id));
        }
        for (name, value) in overrides {
            headers.push((name, value.clone()));
        }
        headers
    }

    /// Top-level login sequence: try the cached session token first, then
    /// SRP, falling back to raw password on SRP failure, then exchange the
    /// resulting token for the `webservices` document.
    pub async fn login(&self) -> Result<AuthOutcome, SyncError> {
        if self.transport.session_snapshot().session_token.is_some() {
            if let Ok(data) = self.validate_token().await {
                return self.finish_login(data).await;
            }
            tracing::debug!("cached session token is no longer valid, logging in from scratch");
        }

        match self.authenticate_srp().await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(error = %err, "SRP login failed, falling back to raw password");
                self.authenticate_raw_password().await?;
            }
        }

        let data = self.authenticate_with_token().await?;
        self.finish_login(data).await
    }

    async fn finish_login(&self, data: Value) -> Result<AuthOutcome, SyncError> {
        if requires_2fa(&data) {
            return Ok(AuthOutcome::MfaRequired);
        }
        Ok(AuthOutcome::Success { data })
    }

    async fn validate_token(&self) -> Result<Value, SyncError> {
        let url = format!("{}/validate", self.domain.setup_endpoint());
        let response = self
            .transport
            .request_json(Method::POST, &url, Some(&Value::Null), &[])
            .await?;
        Ok(response.body)
    }

    async fn authenticate_srp(&self) -> Result<(), SyncError> {
        let client = SrpClient::new();
        let init_body = json!({
            "a": STANDARD.encode(client.public_key()),
            "accountName": self.account_name,
            "protocols": ["s2k", "s2k_fo"],
        });
        let headers = self.auth_headers(&[]);
        let url = format!("{}/signin/init", self.domain.auth_endpoint());
        let response = self
            .transport
            .request_json(Method::POST, &url, Some(&init_body), &headers)
            .await
            .map_err(|_| SyncError::FailedLogin)?;

        let body = response.body;
        let salt = STANDARD
            .decode(body.get("salt").and_then(Value::as_str).unwrap_or_default())
            .map_err(|_| SyncError::FailedLogin)?;
        let b_pub = STANDARD
            .decode(body.get("b").and_then(Value::as_str).unwrap_or_default())
            .map_err(|_| SyncError::FailedLogin)?;
        let c = body.get("c").and_then(Value::as_str).unwrap_or_default().to_string();
        let iterations = body.get("iteration").and_then(Value::as_u64).unwrap_or(0) as u32;
        let protocol = S2kProtocol::parse(body.get("protocol").and_then(Value::as_str).unwrap_or_default())
            .ok_or(SyncError::FailedLogin)?;

        let password_key = derive_password_key(protocol, &self.password, &salt, iterations);
        let (m1, m2, _session_key) = client
            .process_challenge(&self.account_name, &password_key, &salt, &b_pub)
            .map_err(|_| SyncError::FailedLogin)?;

        let mut trust_tokens = Vec::new();
        if let Some(token) = self.transport.session_snapshot().trust_token {
            trust_tokens.push(token);
        }
        let complete_body = json!({
            "accountName": self.account_name,
            "c": c,
            "m1": STANDARD.encode(m1),
            "m2": STANDARD.encode(m2),
            "rememberMe": true,
            "trustTokens": trust_tokens,
        });

        let complete_url = format!("{}/signin/complete?isRememberMeEnabled=true", self.domain.auth_endpoint());
        match self.transport.request_json(Method::POST, &complete_url, Some(&complete_body), &headers).await {
            Ok(_) => Ok(()),
            Err(SyncError::Api { code, .. }) if code == "409" => Ok(()), // 2FA required, handled by caller
            Err(SyncError::Api { code, .. }) if code == "412" => {
                let repair_url = format!("{}/repair/complete", self.domain.auth_endpoint());
                self.transport
                    .request_json(Method::POST, &repair_url, Some(&json!({})), &self.auth_headers(&[]))
                    .await?;
                Ok(())
            }
            Err(_) => Err(SyncError::FailedLogin),
        }
    }

    async fn authenticate_raw_password(&self) -> Result<(), SyncError> {
        let mut trust_tokens = Vec::new();
        if let Some(token) = self.transport.session_snapshot().trust_token {
            trust_tokens.push(token);
        }
        let body = json!({
            "accountName": self.account_name,
            "password": self.password,
            "rememberMe": true,
            "trustTokens": trust_tokens,
        });
        let url = format!("{}/signin?isRememberMeEnabled=true", self.domain.auth_endpoint());
        let headers = self.auth_headers(&[]);
        self.transport
            .request_json(Method::POST, &url, Some(&body), &headers)
            .await
            .map_err(|_| SyncError::FailedLogin)?;
        Ok(())
    }

    async fn authenticate_with_token(&self) -> Result<Value, SyncError> {
        let session = self.transport.session_snapshot();
        let body = json!({
            "accountCountryCode": session.account_country,
            "dsWebAuthToken": session.session_token,
            "extended_login": true,
            "trustToken": session.trust_token.unwrap_or_default(),
        });
        let url = format!("{}/accountLogin", self.domain.setup_endpoint());
        let response = self
            .transport
            .request_json(Method::POST, &url, Some(&body), &[])
            .await
            .map_err(|_| SyncError::FailedLogin)?;

        if let Some(domain_to_use) = response.body.get("domainToUse").and_then(Value::as_str) {
            return Err(SyncError::DomainMismatch { domain_to_use: domain_to_use.to_string() });
        }

        Ok(response.body)
    }

    /// Submits an HSA2 code (spec ref: `validate_2fa_code`). `code` must be
    /// the six-digit string the user received.
    pub async fn validate_2fa_code(&self, code: &str) -> Result<bool, SyncError> {
        let body = json!({"securityCode": {"code": code}});
        let headers = self.auth_headers(&[("Accept", "application/json".to_string())]);
        let url = format!("{}/verify/trusteddevice/securitycode", self.domain.auth_endpoint());
        match self.transport.request_json(Method::POST, &url, Some(&body), &headers).await {
            Ok(_) => Ok(true),
            Err(SyncError::Api { code, .. }) if code == "-21669" => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn trust_session(&self) -> Result<(), SyncError> {
        let headers = self.auth_headers(&[]);
        let url = format!("{}/2sv/trust", self.domain.auth_endpoint());
        self.transport.request_json(Method::GET, &url, None, &headers).await?;
        Ok(())
    }

    /// Runs the MFA prompt loop appropriate to `provider`, blocking until a
    /// code is supplied and verified (or verification is abandoned). Mirrors
    /// `authenticator`'s dispatch between `request_2fa` and
    /// `request_2fa_web`.
    pub async fn resolve_mfa(&self, provider: &MfaProvider) -> Result<(), SyncError> {
        match provider {
            MfaProvider::Interactive => self.resolve_mfa_interactive().await,
            MfaProvider::WebUi(exchange) => self.resolve_mfa_webui(exchange).await,
        }
    }

    async fn resolve_mfa_interactive(&self) -> Result<(), SyncError> {
        loop {
            print!("Please enter two-factor authentication code: ");
            use std::io::Write;
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map_err(|_| SyncError::MfaFailed)?;
            let code = line.trim();
            if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
                println!("Invalid code, should be six digits. Try again");
                continue;
            }
            if self.validate_2fa_code(code).await? {
                self.trust_session().await.ok();
                return Ok(());
            }
            println!("Code verification failed. Try again");
        }
    }

    /// Logs in, resolving MFA through `provider` if Apple asks for one,
    /// and returns the final account envelope. Shared between the watch
    /// loop's per-pass authentication and the one-shot `--auth-only` /
    /// `--list-albums` / `--list-libraries` code paths in `main.rs`, so
    /// both exercise the exact same MFA dispatch (spec ref: §4.2
    /// Authenticator, §4.7 WatchLoop).
    pub async fn login_with_mfa(
        &self,
        provider: &MfaProvider,
        on_mfa_required: impl FnOnce(),
    ) -> Result<Value, SyncError> {
        match self.login().await? {
            AuthOutcome::Success { data } => Ok(data),
            AuthOutcome::MfaRequired => {
                on_mfa_required();
                self.resolve_mfa(provider).await?;
                match self.login().await? {
                    AuthOutcome::Success { data } => Ok(data),
                    AuthOutcome::MfaRequired => Err(SyncError::MfaFailed),
                }
            }
        }
    }

    async fn resolve_mfa_webui(&self, exchange: &StatusExchange) -> Result<(), SyncError> {
        if !exchange.replace_status(Status::NoInputNeeded, Status::NeedMfa) {
            return Err(SyncError::MfaFailed);
        }
        loop {
            let status = exchange.wait_while(Status::NeedMfa, Duration::from_secs(1));
            if status != Status::SuppliedMfa {
                continue;
            }
            if !exchange.replace_status(Status::SuppliedMfa, Status::CheckingMfa) {
                return Err(SyncError::MfaFailed);
            }
            let Some(code) = exchange.get_payload() else {
                return Err(SyncError::MfaFailed);
            };
            match self.validate_2fa_code(&code).await {
                Ok(true) => {
                    self.trust_session().await.ok();
                    exchange.replace_status(Status::CheckingMfa, Status::NoInputNeeded);
                    return Ok(());
                }
                Ok(false) => {
                    if !exchange.set_error("Failed to verify two-factor authentication code") {
                        return Err(SyncError::MfaFailed);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// `hsaVersion == 2` with a qualifying device and either an explicit
/// challenge pending or an untrusted browser, mirroring
/// `PyiCloudService.requires_2fa`.
fn requires_2fa(data: &Value) -> bool {
    let ds_info = data.get("dsInfo");
    let hsa_version = ds_info.and_then(|d| d.get("hsaVersion")).and_then(Value::as_i64).unwrap_or(0);
    let qualifying_device = ds_info
        .and_then(|d| d.get("hasICloudQualifyingDevice"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let challenge_required = data.get("hsaChallengeRequired").and_then(Value::as_bool).unwrap_or(false);
    let trusted_browser = data.get("hsaTrustedBrowser").and_then(Value::as_bool).unwrap_or(false);
    hsa_version == 2 && qualifying_device && (challenge_required || !trusted_browser)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_endpoints_are_fixed_per_domain() {
        assert_eq!(Domain::Com.auth_endpoint(), "https://idmsa.apple.com/appleauth/auth");
        assert_eq!(Domain::Cn.home_endpoint(), "https://www.icloud.com.cn");
    }

    #[test]
    fn unsupported_domain_is_rejected() {
        assert!(Domain::parse("fr").is_err());
    }

    #[test]
    fn requires_2fa_checks_all_three_conditions() {
        let full = json!({
            "dsInfo": {"hsaVersion": 2, "hasICloudQualifyingDevice": true},
            "hsaChallengeRequired": true,
            "hsaTrustedBrowser": true,
        });
        assert!(requires_2fa(&full));

        let wrong_version = json!({
            "dsInfo": {"hsaVersion": 1, "hasICloudQualifyingDevice": true},
            "hsaChallengeRequired": true,
        });
        assert!(!requires_2fa(&wrong_version));

        let no_challenge_trusted_browser = json!({
            "dsInfo": {"hsaVersion": 2, "hasICloudQualifyingDevice": true},
            "hsaChallengeRequired": false,
            "hsaTrustedBrowser": true,
        });
        assert!(!requires_2fa(&no_challenge_trusted_browser));
    }

    #[test]
    fn requires_2fa_when_browser_is_untrusted_even_without_challenge() {
        let untrusted_browser = json!({
            "dsInfo": {"hsaVersion": 2, "hasICloudQualifyingDevice": true},
            "hsaChallengeRequired": false,
            "hsaTrustedBrowser": false,
        });
        assert!(requires_2fa(&untrusted_browser));
    }

    #[test]
    fn no_2fa_required_without_qualifying_device() {
        let no_device = json!({
            "dsInfo": {"hsaVersion": 2, "hasICloudQualifyingDevice": false},
            "hsaChallengeRequired": true,
        });
        assert!(!requires_2fa(&no_device));
    }
}
