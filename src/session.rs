//! Persisted authentication state (spec ref: §3 Session / Webservices map,
//! §4.1 SessionStore).
//!
//! Grounded in `pyicloud_ipd/session.py`'s `HEADER_DATA` map and
//! `pyicloud_ipd/base.py`'s cookiejar/session-file path scheme, adapted to
//! the teacher's atomic temp-then-rename persistence idiom (`manifest.rs`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::util::{ensure_private_dir, expand_path};

/// Response header -> session field, in the order the original iterates
/// `HEADER_DATA`. Every response is scanned for these headers and any
/// present value is written into `Session` before the caller observes the
/// response body.
pub const HEADER_DATA: &[(&str, SessionField)] = &[
    ("X-Apple-ID-Account-Country", SessionField::AccountCountry),
    ("X-Apple-ID-Session-Id", SessionField::SessionId),
    ("X-Apple-Session-Token", SessionField::SessionToken),
    ("X-Apple-TwoSV-Trust-Token", SessionField::TrustToken),
    ("X-Apple-TwoSV-Trust-Eligible", SessionField::TrustEligible),
    ("X-Apple-I-Rscd", SessionField::AppleRscd),
    ("X-Apple-I-Ercd", SessionField::AppleErcd),
    ("scnt", SessionField::Scnt),
];

#[derive(Debug, Clone, Copy)]
pub enum SessionField {
    AccountCountry,
    SessionId,
    SessionToken,
    TrustToken,
    TrustEligible,
    AppleRscd,
    AppleErcd,
    Scnt,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Session {
    pub account_country: Option<String>,
    pub session_id: Option<String>,
    pub session_token: Option<String>,
    pub trust_token: Option<String>,
    pub trust_eligible: Option<String>,
    pub apple_rscd: Option<String>,
    pub apple_ercd: Option<String>,
    pub scnt: Option<String>,
    pub client_id: String,
}

impl Session {
    pub fn new_with_client_id(client_id: String) -> Self {
        Self {
            client_id,
            ..Default::default()
        }
    }

    pub fn set_field(&mut self, field: SessionField, value: String) {
        match field {
            SessionField::AccountCountry => self.account_country = Some(value),
            SessionField::SessionId => self.session_id = Some(value),
            SessionField::SessionToken => self.session_token = Some(value),
            SessionField::TrustToken => self.trust_token = Some(value),
            SessionField::TrustEligible => self.trust_eligible = Some(value),
            SessionField::AppleRscd => self.apple_rscd = Some(value),
            SessionField::AppleErcd => self.apple_ercd = Some(value),
            SessionField::Scnt => self.scnt = Some(value),
        }
    }
}

/// A single stored cookie. The reference stores an LWP-format Netscape
/// cookie jar; we approximate it with an equivalent JSON document so the
/// jar round-trips byte-identically through serde without depending on a
/// separate cookie-jar parser crate (see DESIGN.md Open Question: cookie
/// jar format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCookie {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CookieJar {
    pub cookies: BTreeMap<String, StoredCookie>,
}

impl CookieJar {
    pub fn set(&mut self, name: impl Into<String>, cookie: StoredCookie) {
        self.cookies.insert(name.into(), cookie);
    }

    /// Renders the jar as a `Cookie:` request header value.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let now = OffsetDateTime::now_utc();
        let parts: Vec<String> = self
            .cookies
            .iter()
            .filter(|(_, c)| c.expires.map(|e| e > now).unwrap_or(true))
            .map(|(name, c)| format!("{name}={}", c.value))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }

    /// Parses one `Set-Cookie` header value and merges it into the jar.
    pub fn apply_set_cookie(&mut self, raw: &str) {
        let mut attrs = raw.split(';').map(str::trim);
        let Some(name_value) = attrs.next() else {
            return;
        };
        let Some((name, value)) = name_value.split_once('=') else {
            return;
        };
        let mut cookie = StoredCookie {
            value: value.to_string(),
            domain: None,
            path: None,
            expires: None,
        };
        for attr in attrs {
            let lower = attr.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("domain=") {
                cookie.domain = Some(v.to_string());
            } else if let Some(v) = lower.strip_prefix("path=") {
                cookie.path = Some(v.to_string());
            }
        }
        self.set(name.to_string(), cookie);
    }
}

pub struct SessionStore {
    cookie_directory: PathBuf,
}

fn sanitize_account_name(account_name: &str) -> String {
    account_name.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect()
}

impl SessionStore {
    pub fn new(cookie_directory: &Path) -> Result<Self> {
        let dir = expand_path(cookie_directory)?;
        ensure_private_dir(&dir)?;
        Ok(Self { cookie_directory: dir })
    }

    fn session_path(&self, account_name: &str) -> PathBuf {
        self.cookie_directory
            .join(format!("{}.session", sanitize_account_name(account_name)))
    }

    fn cookiejar_path(&self, account_name: &str) -> PathBuf {
        self.cookie_directory.join(sanitize_account_name(account_name))
    }

    /// Reads both files; returns an empty session/jar (with a freshly
    /// generated client id) if either is missing or fails to parse. A
    /// cookie-jar parse failure is logged and treated as empty so that
    /// upgrading from an older on-disk format doesn't crash the run.
    pub fn load(&self, account_name: &str, client_id_override: Option<String>) -> (Session, CookieJar) {
        let session_path = self.session_path(account_name);
        let mut session = match std::fs::read(&session_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Session::default(),
        };

        if let Some(client_id) = client_id_override {
            session.client_id = client_id;
        } else if session.client_id.is_empty() {
            session.client_id = format!("auth-{}", Uuid::new_v4());
        }

        let cookiejar_path = self.cookiejar_path(account_name);
        let jar = match std::fs::read(&cookiejar_path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(jar) => jar,
                Err(err) => {
                    tracing::warn!(error = %err, path = %cookiejar_path.display(), "failed to parse cookie jar, starting fresh");
                    CookieJar::default()
                }
            },
            Err(_) => CookieJar::default(),
        };

        (session, jar)
    }

    /// Atomic: write-to-temp-then-rename for both files, so a crash never
    /// leaves a half-written session that loses a freshly issued trust
    /// token (spec invariant in §4.1 and §8).
    pub fn save(&self, account_name: &str, session: &Session, jar: &CookieJar) -> Result<()> {
        write_atomic(&self.session_path(account_name), &serde_json::to_vec(session)?)?;
        write_atomic(&self.cookiejar_path(account_name), &serde_json::to_vec_pretty(jar)?)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_session_and_cookies() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let (mut session, mut jar) = store.load("user@example.com", None);
        assert!(!session.client_id.is_empty());
        session.set_field(SessionField::SessionToken, "tok-1".to_string());
        jar.apply_set_cookie("X-APPLE-WEBAUTH-TOKEN=abc123; Domain=.icloud.com; Path=/");

        store.save("user@example.com", &session, &jar).unwrap();

        let (loaded_session, loaded_jar) = store.load("user@example.com", None);
        assert_eq!(loaded_session.session_token.as_deref(), Some("tok-1"));
        assert_eq!(loaded_session.client_id, session.client_id);
        assert_eq!(loaded_jar.cookies.get("X-APPLE-WEBAUTH-TOKEN").unwrap().value, "abc123");
    }

    #[test]
    fn client_id_stable_across_loads() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let (session, jar) = store.load("a@b.com", None);
        store.save("a@b.com", &session, &jar).unwrap();
        let (second, _) = store.load("a@b.com", None);
        assert_eq!(session.client_id, second.client_id);
    }

    #[test]
    fn corrupt_cookiejar_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        std::fs::write(store.cookiejar_path("a@b.com"), b"not json").unwrap();
        let (_, jar) = store.load("a@b.com", None);
        assert!(jar.cookies.is_empty());
    }
}
