//! Password acquisition (spec ref: SPEC_FULL.md §1 ambient stack,
//! "PasswordSource").
//!
//! The original expects a password on the command line or in an
//! interactive prompt. This adds an OS-keyring-backed source so a
//! long-running watch process never has to keep the cleartext password in
//! its argv. Grounded in the teacher's collaborator-trait style (small
//! trait, one method, a couple of concrete implementations passed in by the
//! caller rather than selected by a runtime enum).

use anyhow::{Context, Result, bail};
use std::io::Write;

const KEYRING_SERVICE: &str = "icloudpd-rs";

pub trait PasswordSource: Send + Sync {
    fn get_password(&self, account: &str) -> Result<String>;
}

/// Password was supplied directly, e.g. via `--password` or an env var.
pub struct DirectPassword(pub String);

impl PasswordSource for DirectPassword {
    fn get_password(&self, _account: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads from the OS-native credential store (Keychain, Secret Service,
/// Credential Manager) via the `keyring` crate.
pub struct KeyringPassword;

impl PasswordSource for KeyringPassword {
    fn get_password(&self, account: &str) -> Result<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, account).context("opening keyring entry")?;
        entry
            .get_password()
            .with_context(|| format!("no password stored in the keyring for '{account}'; run with --password once to seed it"))
    }
}

/// Stores a password in the OS keyring for later `KeyringPassword` lookups.
pub fn store_in_keyring(account: &str, password: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, account).context("opening keyring entry")?;
    entry.set_password(password).context("writing password to keyring")
}

/// Prompts on the controlling terminal and reads one line from stdin.
pub struct PromptPassword;

impl PasswordSource for PromptPassword {
    fn get_password(&self, account: &str) -> Result<String> {
        print!("iCloud password for {account}: ");
        std::io::stdout().flush().ok();
        let password = read_line_trimmed()?;
        if password.is_empty() {
            bail!("no password entered");
        }
        Ok(password)
    }
}

fn read_line_trimmed() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).context("reading password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_password_returns_the_configured_value() {
        let source = DirectPassword("hunter2".to_string());
        assert_eq!(source.get_password("a@b.com").unwrap(), "hunter2");
    }
}
