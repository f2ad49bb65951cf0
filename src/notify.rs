//! Notification delivery for conditions a watch loop can't otherwise
//! surface to an operator (spec ref: SPEC_FULL.md §1 ambient stack,
//! "Notifier"; §4.7 WatchLoop MFA-expiry handling).
//!
//! Grounded in the teacher's notifier-as-trait-object pattern: `WatchLoop`
//! holds a `Box<dyn Notifier>` and never knows whether it's mailing anyone
//! or not. `SmtpNotifier` is built on `lettre`, the same crate family the
//! example pack reaches for whenever outbound mail is needed.

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as LettreTransport};

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Discards every notification. Used when no SMTP relay is configured.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, subject: &str, _body: &str) -> Result<()> {
        tracing::debug!(subject, "notifications disabled, dropping");
        Ok(())
    }
}

pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    pub fn new(host: &str, port: u16, username: Option<&str>, password: Option<&str>, from: &str, to: &str) -> Result<Self> {
        let builder = SmtpTransport::relay(host).with_context(|| format!("resolving SMTP relay '{host}'"))?.port(port);
        let builder = match (username, password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.to_string(), pass.to_string())),
            _ => builder,
        };
        Ok(Self {
            transport: builder.build(),
            from: from.parse().context("parsing notify-smtp-from address")?,
            to: to.parse().context("parsing notify-smtp-to address")?,
        })
    }
}

impl Notifier for SmtpNotifier {
    fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .body(body.to_string())
            .context("building notification email")?;
        self.transport.send(&message).context("sending notification email")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_notifier_never_fails() {
        let notifier = NoopNotifier;
        assert!(notifier.notify("subject", "body").is_ok());
    }
}
