//! WatchLoop: re-runs SyncDriver on a fixed interval, reacting to remote
//! commands and MFA-required errors in between (spec ref: §4.7 WatchLoop).
//!
//! Grounded in the teacher's `watch.rs::run`: a loop around an
//! interruptible sleep, checked against shared state every iteration, with
//! helper functions split out per phase (authenticate, run one pass, sleep
//! until the next). The embedded control server and its command channel
//! are the supplemental piece (`command.rs`), mirroring the teacher's own
//! embedded `ui.rs` server instead of inventing a new pattern.

use crate::auth::{Authenticator, MfaProvider};
use crate::command::{CommandSource, ControlCommand, ControlServer};
use crate::config::{Config, MfaProviderArg};
use crate::error::SyncError;
use crate::exif::ExifWriter;
use crate::notify::Notifier;
use crate::photos::PhotoService;
use crate::status::StatusExchange;
use crate::sync::SyncDriver;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};

pub struct WatchLoop {
    config: Config,
    authenticator: Arc<Authenticator>,
    notifier: Box<dyn Notifier>,
    exif_writer: Arc<dyn ExifWriter>,
    status: StatusExchange,
    control: Option<ControlServer>,
}

impl WatchLoop {
    pub fn new(
        config: Config,
        authenticator: Arc<Authenticator>,
        notifier: Box<dyn Notifier>,
        exif_writer: Arc<dyn ExifWriter>,
        status: StatusExchange,
        control: Option<ControlServer>,
    ) -> Self {
        Self { config, authenticator, notifier, exif_writer, status, control }
    }

    /// Runs passes forever on `config.watch_interval`, or exactly once if
    /// no interval is configured. Returns on `FailedLogin`/`DomainMismatch`
    /// (terminal per spec §7) or an explicit `stop` command.
    pub async fn run(mut self) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        let once = self.config.watch_interval.is_none();
        let mut force_full = false;

        loop {
            cancel.store(false, Ordering::SeqCst);
            self.update_snapshot(|s| {
                s.running = true;
                s.last_run_started = Some(now_rfc3339());
                s.waiting_seconds = None;
            });

            match self.run_one_pass(&cancel, force_full).await {
                Ok(()) => {
                    self.update_snapshot(|s| s.last_error = None);
                }
                Err(err) if is_terminal(&err) => {
                    self.update_snapshot(|s| {
                        s.running = false;
                        s.last_error = Some(err.to_string());
                    });
                    self.shutdown_control().await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "sync pass failed, will retry next interval");
                    self.update_snapshot(|s| s.last_error = Some(err.to_string()));
                }
            }
            force_full = false;
            self.update_snapshot(|s| {
                s.running = false;
                s.last_run_finished = Some(now_rfc3339());
            });

            if once {
                self.shutdown_control().await;
                return Ok(());
            }

            match self.sleep_until_next_run(&cancel).await {
                NextAction::Stop => {
                    self.shutdown_control().await;
                    return Ok(());
                }
                NextAction::RunNow => {}
                NextAction::RunAll => force_full = true,
            }
        }
    }

    async fn run_one_pass(&self, cancel: &Arc<AtomicBool>, force_full: bool) -> Result<()> {
        let photos = self.authenticate_and_build_service().await?;
        let downloader = crate::download::Downloader::new(self.authenticator.transport().clone(), self.config.dry_run);
        let local_offset = crate::util::local_utc_offset();
        let driver = SyncDriver::new(self.config.clone(), photos, downloader, self.authenticator.clone(), self.exif_writer.clone(), local_offset);

        let outcome = driver.run(cancel, force_full).await?;
        let to_download = outcome.to_download_count();
        self.update_snapshot(|s| {
            s.assets_downloaded_last_run = outcome.downloaded;
            s.total_assets_downloaded += outcome.downloaded;
            s.total_count = outcome.total_count;
            s.checked_count = outcome.checked_count;
            s.to_download_count = to_download;
            s.last_sync_unix = Some(OffsetDateTime::now_utc().unix_timestamp());
        });
        Ok(())
    }

    /// Logs in, resolving MFA through the configured provider if Apple asks
    /// for it, then builds a fresh `PhotoService` from the resulting
    /// webservices map (spec ref: §4.2 Authenticator, §4.3 PhotoService).
    async fn authenticate_and_build_service(&self) -> Result<PhotoService> {
        let provider = self.mfa_provider();
        let notifier = &self.notifier;
        let data = self
            .authenticator
            .login_with_mfa(&provider, || {
                notifier
                    .notify(
                        "iCloud sync needs a two-factor code",
                        "Authentication requires a two-factor code. Supply one via the console or POST /api/mfa-code.",
                    )
                    .ok();
            })
            .await?;

        let service_root = data
            .pointer("/webservices/ckdatabasews/url")
            .and_then(serde_json::Value::as_str)
            .ok_or(SyncError::ServiceNotActivated)?;
        let dsid = data.pointer("/dsInfo/dsid").and_then(serde_json::Value::as_str).unwrap_or_default();
        let client_id = self.authenticator.transport().client_id();

        Ok(PhotoService::new(
            self.authenticator.transport().clone(),
            service_root,
            dsid,
            &client_id,
            self.config.file_match_policy,
            self.config.raw_align_policy,
        ))
    }

    fn mfa_provider(&self) -> MfaProvider {
        match self.config.mfa_provider {
            MfaProviderArg::Interactive => MfaProvider::Interactive,
            MfaProviderArg::WebUi => MfaProvider::WebUi(self.status.clone()),
        }
    }

    /// Sleeps for `watch_interval`, waking early on a `sync-now`/`sync-all`
    /// command, or a `stop` command (spec ref: §5 "WatchLoop vs. control
    /// channels"; command delivery is serialized, one command per window).
    async fn sleep_until_next_run(&mut self, cancel: &Arc<AtomicBool>) -> NextAction {
        let interval = self.config.watch_interval.unwrap_or(Duration::from_secs(1));
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.update_snapshot(|s| s.waiting_seconds = Some(0));
                return NextAction::RunNow;
            }
            self.update_snapshot(|s| s.waiting_seconds = Some((deadline - now).as_secs()));
            if let Some(control) = self.control.as_mut() {
                match control.commands.try_recv() {
                    Some(ControlCommand::SyncNow) => return NextAction::RunNow,
                    Some(ControlCommand::SyncAll) => {
                        tracing::info!("sync-all requested, next pass ignores recent/until-found limits");
                        return NextAction::RunAll;
                    }
                    Some(ControlCommand::Stop) => {
                        cancel.store(true, Ordering::SeqCst);
                        return NextAction::Stop;
                    }
                    None => {}
                }
            }
            sleep(Duration::from_secs(1).min(interval)).await;
        }
    }

    fn update_snapshot(&self, f: impl FnOnce(&mut crate::command::StatusSnapshot)) {
        if let Some(control) = &self.control {
            control.snapshot.update(f);
        }
    }

    async fn shutdown_control(&mut self) {
        if let Some(control) = self.control.take() {
            control.shutdown().await;
        }
    }
}

enum NextAction {
    RunNow,
    RunAll,
    Stop,
}

fn is_terminal(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SyncError>(), Some(SyncError::FailedLogin) | Some(SyncError::DomainMismatch { .. }))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
