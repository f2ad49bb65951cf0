//! CLI surface and resolved configuration (spec ref: §6 External Interfaces,
//! SPEC_FULL.md §1 "Configuration").
//!
//! Grounded in the teacher's `Cli`/`*Args` + fallible `WatchConfig::from_args`
//! split (`config.rs` in the reference binary): `clap` derive drives the
//! flag surface, and a secondary `Config` struct resolves paths, applies
//! defaults, and validates mutually exclusive options before any I/O
//! happens. Password resolution is I/O (keyring lookup, TTY prompt) and is
//! therefore deliberately *not* done here — see `password.rs`.

use crate::asset::{FileMatchPolicy, RawTreatmentPolicy, VersionSize};
use crate::auth::Domain;
use crate::util::expand_path;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum SizeArg {
    Original,
    Medium,
    Thumb,
    Adjusted,
    Alternative,
}

impl SizeArg {
    pub fn to_version_size(self) -> VersionSize {
        match self {
            SizeArg::Original => VersionSize::Original,
            SizeArg::Medium => VersionSize::Medium,
            SizeArg::Thumb => VersionSize::Thumb,
            SizeArg::Adjusted => VersionSize::Adjusted,
            SizeArg::Alternative => VersionSize::Alternative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum LivePhotoSizeArg {
    Original,
    Medium,
    Thumb,
}

impl LivePhotoSizeArg {
    pub fn to_version_size(self) -> VersionSize {
        match self {
            LivePhotoSizeArg::Original => VersionSize::LiveOriginal,
            LivePhotoSizeArg::Medium => VersionSize::LiveMedium,
            LivePhotoSizeArg::Thumb => VersionSize::LiveThumb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum FileMatchPolicyArg {
    NameSizeDedupWithSuffix,
    NameId7,
}

impl From<FileMatchPolicyArg> for FileMatchPolicy {
    fn from(value: FileMatchPolicyArg) -> Self {
        match value {
            FileMatchPolicyArg::NameSizeDedupWithSuffix => FileMatchPolicy::NameSizeDedupWithSuffix,
            FileMatchPolicyArg::NameId7 => FileMatchPolicy::NameId7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum RawAlignArg {
    Original,
    Alternative,
    AsIs,
}

impl From<RawAlignArg> for RawTreatmentPolicy {
    fn from(value: RawAlignArg) -> Self {
        match value {
            RawAlignArg::Original => RawTreatmentPolicy::AsOriginal,
            RawAlignArg::Alternative => RawTreatmentPolicy::AsAlternative,
            RawAlignArg::AsIs => RawTreatmentPolicy::AsIs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum DomainArg {
    Com,
    Cn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum MfaProviderArg {
    Interactive,
    WebUi,
}

/// Recognized flags, one field per SyncDriver configuration option (spec
/// ref: §6 table). Supplemental flags (auth-only, notify-smtp-*, ui-*,
/// skip-created-before/after) are additive, not a substitute for any of the
/// distilled flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "icloudpd-rs", version, about = "Download photos and videos from iCloud", long_about = None)]
pub struct Cli {
    /// iCloud account name (email-like identity)
    #[arg(long, env = "ICLOUD_USERNAME")]
    pub username: String,

    /// iCloud account password; resolved from keyring or a TTY prompt if omitted
    #[arg(long, env = "ICLOUD_PASSWORD")]
    pub password: Option<String>,

    /// Resolve the password from the OS keyring instead of a direct flag
    #[arg(long = "use-keyring")]
    pub use_keyring: bool,

    /// Seed the OS keyring with --password so future runs can pass --use-keyring instead
    #[arg(long = "save-password-to-keyring", requires = "password")]
    pub save_password_to_keyring: bool,

    /// Output root for downloaded assets
    #[arg(long, default_value = ".")]
    pub directory: PathBuf,

    /// Directory for the session cookie jar and session file
    #[arg(long = "cookie-directory")]
    pub cookie_directory: Option<PathBuf>,

    /// Size variant to download; repeat for multiple sizes
    #[arg(long = "size", value_enum)]
    pub size: Vec<SizeArg>,

    /// Size variant for the live-photo movie sibling
    #[arg(long = "live-photo-size", value_enum, default_value = "original")]
    pub live_photo_size: LivePhotoSizeArg,

    /// Only look at the N most recently added assets
    #[arg(long)]
    pub recent: Option<u64>,

    /// Stop after N consecutive assets already present locally
    #[arg(long = "until-found")]
    pub until_found: Option<u64>,

    /// Album to sync
    #[arg(long, default_value = "All Photos")]
    pub album: String,

    /// Library (zone) to sync
    #[arg(long, default_value = "PrimarySync")]
    pub library: String,

    /// Print the available albums and exit
    #[arg(long = "list-albums")]
    pub list_albums: bool,

    /// Print the available libraries and exit
    #[arg(long = "list-libraries")]
    pub list_libraries: bool,

    /// Skip video assets
    #[arg(long = "skip-videos")]
    pub skip_videos: bool,

    /// Skip the live-photo movie sibling
    #[arg(long = "skip-live-photos")]
    pub skip_live_photos: bool,

    /// Skip photo assets (videos only)
    #[arg(long = "skip-photos")]
    pub skip_photos: bool,

    /// Never fall back to original when a requested size is unavailable
    #[arg(long = "force-size")]
    pub force_size: bool,

    /// After a run, mirror local deletions for anything in Recently Deleted
    #[arg(long = "auto-delete")]
    pub auto_delete: bool,

    /// Delete the remote original after a successful local download
    #[arg(long = "delete-after-download")]
    pub delete_after_download: bool,

    /// Guard for --delete-after-download: keep anything newer than N days
    #[arg(long = "keep-icloud-recent-days")]
    pub keep_icloud_recent_days: Option<i64>,

    /// Print target filenames without downloading anything
    #[arg(long = "only-print-filenames")]
    pub only_print_filenames: bool,

    /// Date-based subfolder template (tokens: %Y %m %d %H %M %S), or "none"
    #[arg(long = "folder-structure", default_value = "%Y/%m/%d")]
    pub folder_structure: String,

    /// How local filenames are disambiguated against same-named assets
    #[arg(long = "file-match-policy", value_enum, default_value = "name-size-dedup-with-suffix")]
    pub file_match_policy: FileMatchPolicyArg,

    /// Which of original/alternative holds the raw file in a raw+JPEG pair
    #[arg(long = "align-raw", value_enum, default_value = "as-is")]
    pub align_raw: RawAlignArg,

    /// Backfill EXIF DateTimeOriginal on downloaded JPEGs that lack it
    #[arg(long = "set-exif-datetime")]
    pub set_exif_datetime: bool,

    /// Endpoint group to use
    #[arg(long, value_enum, default_value = "com")]
    pub domain: DomainArg,

    /// Run as a daemon, re-syncing every N seconds
    #[arg(long = "watch-with-interval")]
    pub watch_with_interval: Option<u64>,

    /// Perform no filesystem or remote mutation
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Authenticate, persist the session, and exit without syncing
    #[arg(long = "auth-only")]
    pub auth_only: bool,

    /// Skip assets created before this RFC3339 timestamp
    #[arg(long = "skip-created-before")]
    pub skip_created_before: Option<String>,

    /// Skip assets created on/after this RFC3339 timestamp
    #[arg(long = "skip-created-after")]
    pub skip_created_after: Option<String>,

    /// SMTP host for the MFA-required notifier
    #[arg(long = "notify-smtp-host")]
    pub notify_smtp_host: Option<String>,

    /// SMTP port for the MFA-required notifier
    #[arg(long = "notify-smtp-port", default_value_t = 587)]
    pub notify_smtp_port: u16,

    /// SMTP username, if the relay requires auth
    #[arg(long = "notify-smtp-username")]
    pub notify_smtp_username: Option<String>,

    /// SMTP password, if the relay requires auth
    #[arg(long = "notify-smtp-password")]
    pub notify_smtp_password: Option<String>,

    /// From address for notification emails
    #[arg(long = "notify-smtp-from")]
    pub notify_smtp_from: Option<String>,

    /// To address for notification emails
    #[arg(long = "notify-smtp-to")]
    pub notify_smtp_to: Option<String>,

    /// Disable the embedded status/control HTTP server
    #[arg(long = "ui-disable")]
    pub ui_disable: bool,

    /// Bind address for the embedded status/control HTTP server
    #[arg(long = "ui-bind", env = "ICLOUDPD_UI_BIND", default_value = "127.0.0.1")]
    pub ui_bind: String,

    /// TCP port for the embedded status/control HTTP server
    #[arg(long = "ui-port", env = "ICLOUDPD_UI_PORT", default_value_t = 4333)]
    pub ui_port: u16,

    /// How an MFA code reaches the authenticator when one is required
    #[arg(long = "mfa-provider", value_enum, default_value = "interactive")]
    pub mfa_provider: MfaProviderArg,

    /// Override the persisted per-cookie-jar client id
    #[arg(long = "client-id", env = "CLIENT_ID")]
    pub client_id: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long = "http-timeout-secs", default_value_t = 60)]
    pub http_timeout_secs: u64,

    /// Verbose logging (sets RUST_LOG=debug if unset)
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: Option<String>,
    pub use_keyring: bool,
    pub save_password_to_keyring: bool,
    pub directory: PathBuf,
    pub cookie_directory: PathBuf,
    pub sizes: Vec<VersionSize>,
    pub live_photo_size: VersionSize,
    pub recent: Option<u64>,
    pub until_found: Option<u64>,
    pub album: String,
    pub library: String,
    pub list_albums: bool,
    pub list_libraries: bool,
    pub skip_videos: bool,
    pub skip_live_photos: bool,
    pub skip_photos: bool,
    pub force_size: bool,
    pub auto_delete: bool,
    pub delete_after_download: bool,
    pub keep_icloud_recent_days: Option<i64>,
    pub only_print_filenames: bool,
    pub folder_structure: String,
    pub file_match_policy: FileMatchPolicy,
    pub raw_align_policy: RawTreatmentPolicy,
    pub set_exif_datetime: bool,
    pub domain: Domain,
    pub watch_interval: Option<Duration>,
    pub dry_run: bool,
    pub auth_only: bool,
    pub skip_created_before: Option<time::OffsetDateTime>,
    pub skip_created_after: Option<time::OffsetDateTime>,
    pub notify: NotifyConfig,
    pub ui: UiConfig,
    pub mfa_provider: MfaProviderArg,
    pub client_id: Option<String>,
    pub http_timeout: Duration,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl NotifyConfig {
    pub fn enabled(&self) -> bool {
        self.smtp_host.is_some() && self.from.is_some() && self.to.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.use_keyring && cli.password.is_some() {
            bail!("--use-keyring and --password are mutually exclusive");
        }
        if cli.skip_photos && cli.skip_videos {
            bail!("--skip-photos and --skip-videos are mutually exclusive (nothing left to sync)");
        }

        let directory = expand_path(&cli.directory)?;
        let cookie_directory = match cli.cookie_directory {
            Some(path) => expand_path(&path)?,
            None => default_cookie_directory()?,
        };

        let sizes: Vec<VersionSize> = if cli.size.is_empty() {
            vec![VersionSize::Original]
        } else {
            let mut seen = Vec::new();
            for size in cli.size {
                let version = size.to_version_size();
                if !seen.contains(&version) {
                    seen.push(version);
                }
            }
            seen
        };

        let watch_interval = cli.watch_with_interval.map(Duration::from_secs);
        if let Some(interval) = watch_interval {
            if interval.is_zero() {
                bail!("--watch-with-interval must be greater than 0");
            }
        }

        let domain = match cli.domain {
            DomainArg::Com => Domain::Com,
            DomainArg::Cn => Domain::Cn,
        };

        let skip_created_before = cli
            .skip_created_before
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .context("invalid --skip-created-before timestamp (expected RFC3339)")?;
        let skip_created_after = cli
            .skip_created_after
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .context("invalid --skip-created-after timestamp (expected RFC3339)")?;

        let http_timeout = Duration::from_secs(cli.http_timeout_secs.max(1));

        Ok(Self {
            username: cli.username,
            password: cli.password,
            use_keyring: cli.use_keyring,
            save_password_to_keyring: cli.save_password_to_keyring,
            directory,
            cookie_directory,
            sizes,
            live_photo_size: cli.live_photo_size.to_version_size(),
            recent: cli.recent,
            until_found: cli.until_found,
            album: cli.album,
            library: cli.library,
            list_albums: cli.list_albums,
            list_libraries: cli.list_libraries,
            skip_videos: cli.skip_videos,
            skip_live_photos: cli.skip_live_photos,
            skip_photos: cli.skip_photos,
            force_size: cli.force_size,
            auto_delete: cli.auto_delete,
            delete_after_download: cli.delete_after_download,
            keep_icloud_recent_days: cli.keep_icloud_recent_days,
            only_print_filenames: cli.only_print_filenames,
            folder_structure: cli.folder_structure,
            file_match_policy: cli.file_match_policy.into(),
            raw_align_policy: cli.align_raw.into(),
            set_exif_datetime: cli.set_exif_datetime,
            domain,
            watch_interval,
            dry_run: cli.dry_run,
            auth_only: cli.auth_only,
            skip_created_before,
            skip_created_after,
            notify: NotifyConfig {
                smtp_host: cli.notify_smtp_host,
                smtp_port: cli.notify_smtp_port,
                smtp_username: cli.notify_smtp_username,
                smtp_password: cli.notify_smtp_password,
                from: cli.notify_smtp_from,
                to: cli.notify_smtp_to,
            },
            ui: UiConfig {
                enabled: !cli.ui_disable,
                bind: cli.ui_bind,
                port: cli.ui_port,
            },
            mfa_provider: cli.mfa_provider,
            client_id: cli.client_id,
            http_timeout,
            verbose: cli.verbose,
        })
    }
}

fn default_cookie_directory() -> Result<PathBuf> {
    let base = directories::BaseDirs::new().context("unable to determine home directory for cookie directory")?;
    Ok(base.home_dir().join(".icloudpd-rs").join("cookies"))
}

fn parse_rfc3339(value: &str) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .context("timestamp must be RFC3339, e.g. 2024-01-01T00:00:00Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli::parse_from(["icloudpd-rs", "--username", "a@b.com"])
    }

    #[test]
    fn defaults_to_original_size_when_none_given() {
        let config = Config::from_cli(base_cli()).unwrap();
        assert_eq!(config.sizes, vec![VersionSize::Original]);
    }

    #[test]
    fn rejects_keyring_and_password_together() {
        let mut cli = base_cli();
        cli.use_keyring = true;
        cli.password = Some("hunter2".to_string());
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn rejects_skip_photos_and_skip_videos_together() {
        let mut cli = base_cli();
        cli.skip_photos = true;
        cli.skip_videos = true;
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn zero_watch_interval_is_rejected() {
        let mut cli = base_cli();
        cli.watch_with_interval = Some(0);
        assert!(Config::from_cli(cli).is_err());
    }
}
