//! Compare-and-swap MFA status exchange between the auth flow and the
//! embedded control surface (spec ref: §4.2 Authenticator, webui MFA path).
//!
//! Grounded in `icloudpd/authentication.py::request_2fa_web`, which blocks
//! in `NEED_MFA` until some other actor (here, the axum control server in
//! `command.rs`) flips the status to `SUPPLIED_MFA` with a payload, then
//! validates the code and reports success or a retryable error.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoInputNeeded,
    NeedPassword,
    NeedMfa,
    SuppliedMfa,
    CheckingMfa,
}

struct Inner {
    status: Status,
    payload: Option<String>,
    error: Option<String>,
}

/// Shared, cloneable handle. The auth task and the control-server task each
/// hold a clone; all state lives behind the mutex.
#[derive(Clone)]
pub struct StatusExchange {
    inner: Arc<(Mutex<Inner>, Condvar)>,
}

impl StatusExchange {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(Inner {
                    status: Status::NoInputNeeded,
                    payload: None,
                    error: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn get_status(&self) -> Status {
        self.inner.0.lock().status
    }

    pub fn get_error(&self) -> Option<String> {
        self.inner.0.lock().error.clone()
    }

    pub fn get_payload(&self) -> Option<String> {
        self.inner.0.lock().payload.clone()
    }

    /// Atomically moves `expected -> next`, clearing any stale error and
    /// payload. Returns `false` (no change) if the current status isn't
    /// `expected` — mirrors the Python CAS semantics exactly.
    pub fn replace_status(&self, expected: Status, next: Status) -> bool {
        let (mutex, cvar) = &*self.inner;
        let mut guard = mutex.lock();
        if guard.status != expected {
            return false;
        }
        guard.status = next;
        guard.error = None;
        if next != Status::SuppliedMfa {
            guard.payload = None;
        }
        cvar.notify_all();
        true
    }

    /// Used by the control server: supplies an MFA code and requests the
    /// `NEED_MFA -> SUPPLIED_MFA` transition in one step, attaching the
    /// payload atomically so a concurrent reader never observes
    /// `SuppliedMfa` with no code.
    pub fn supply_mfa_code(&self, code: String) -> bool {
        let (mutex, cvar) = &*self.inner;
        let mut guard = mutex.lock();
        if guard.status != Status::NeedMfa {
            return false;
        }
        guard.status = Status::SuppliedMfa;
        guard.payload = Some(code);
        guard.error = None;
        cvar.notify_all();
        true
    }

    /// Sets a retryable error and bounces `CHECKING_MFA` back to `NEED_MFA`
    /// so the caller can re-prompt, per the original's "that will loop
    /// forever" comment. Returns `false` if the current status was not
    /// `CHECKING_MFA`, signalling the caller to give up instead.
    pub fn set_error(&self, message: impl Into<String>) -> bool {
        let (mutex, cvar) = &*self.inner;
        let mut guard = mutex.lock();
        if guard.status != Status::CheckingMfa {
            return false;
        }
        guard.status = Status::NeedMfa;
        guard.error = Some(message.into());
        guard.payload = None;
        cvar.notify_all();
        true
    }

    /// Blocks the calling thread until the status is no longer `from`,
    /// waking on every `replace_status`/`supply_mfa_code` call instead of
    /// polling on a fixed interval the way the Python reference does with
    /// `time.sleep(1)`.
    pub fn wait_while(&self, from: Status, timeout: Duration) -> Status {
        let (mutex, cvar) = &*self.inner;
        let mut guard = mutex.lock();
        if guard.status != from {
            return guard.status;
        }
        let result = cvar.wait_for(&mut guard, timeout);
        if result.timed_out() {
            guard.status
        } else {
            guard.status
        }
    }
}

impl Default for StatusExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_status_fails_on_mismatch() {
        let exchange = StatusExchange::new();
        assert!(!exchange.replace_status(Status::NeedMfa, Status::CheckingMfa));
        assert_eq!(exchange.get_status(), Status::NoInputNeeded);
    }

    #[test]
    fn happy_path_round_trip() {
        let exchange = StatusExchange::new();
        assert!(exchange.replace_status(Status::NoInputNeeded, Status::NeedMfa));
        assert!(exchange.supply_mfa_code("123456".to_string()));
        assert_eq!(exchange.get_payload().as_deref(), Some("123456"));
        assert!(exchange.replace_status(Status::SuppliedMfa, Status::CheckingMfa));
        assert!(exchange.replace_status(Status::CheckingMfa, Status::NoInputNeeded));
        assert_eq!(exchange.get_status(), Status::NoInputNeeded);
    }

    #[test]
    fn set_error_bounces_back_to_need_mfa() {
        let exchange = StatusExchange::new();
        exchange.replace_status(Status::NoInputNeeded, Status::NeedMfa);
        exchange.supply_mfa_code("000000".to_string());
        exchange.replace_status(Status::SuppliedMfa, Status::CheckingMfa);
        assert!(exchange.set_error("bad code"));
        assert_eq!(exchange.get_status(), Status::NeedMfa);
        assert_eq!(exchange.get_error().as_deref(), Some("bad code"));
        assert!(exchange.get_payload().is_none());
    }

    #[test]
    fn supply_mfa_code_requires_need_mfa_state() {
        let exchange = StatusExchange::new();
        assert!(!exchange.supply_mfa_code("123456".to_string()));
    }

    #[test]
    fn wait_while_returns_immediately_if_already_past() {
        let exchange = StatusExchange::new();
        exchange.replace_status(Status::NoInputNeeded, Status::NeedMfa);
        let status = exchange.wait_while(Status::NoInputNeeded, Duration::from_millis(50));
        assert_eq!(status, Status::NeedMfa);
    }
}
