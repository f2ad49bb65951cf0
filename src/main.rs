use icloudpd_rs::auth::{Authenticator, MfaProvider};
use icloudpd_rs::command::ControlServer;
use icloudpd_rs::config::{Cli, Config, MfaProviderArg};
use icloudpd_rs::error::SyncError;
use icloudpd_rs::exif::{ExifWriter, LittleExifWriter, NoopExifWriter};
use icloudpd_rs::notify::{Notifier, NoopNotifier, SmtpNotifier};
use icloudpd_rs::password::{store_in_keyring, DirectPassword, KeyringPassword, PasswordSource, PromptPassword};
use icloudpd_rs::photos::PhotoService;
use icloudpd_rs::session::SessionStore;
use icloudpd_rs::status::StatusExchange;
use icloudpd_rs::watch::WatchLoop;
use icloudpd_rs::Result;
use clap::Parser;
use std::sync::Arc;

fn init_tracing(verbose: bool) {
    if std::env::var("RUST_LOG").is_err() {
        let level = if verbose { "debug" } else { "info" };
        unsafe {
            std::env::set_var("RUST_LOG", format!("icloudpd_rs={level},info"));
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    init_tracing(config.verbose);

    match run(config).await {
        Ok(()) => {
            tracing::info!("icloudpd-rs exiting normally");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "icloudpd-rs terminated with error");
            if is_terminal_failure(&err) {
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn is_terminal_failure(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SyncError>(), Some(SyncError::FailedLogin) | Some(SyncError::DomainMismatch { .. }))
}

fn resolve_password(config: &Config) -> Result<String> {
    let source: Box<dyn PasswordSource> = if config.use_keyring {
        Box::new(KeyringPassword)
    } else if let Some(password) = &config.password {
        Box::new(DirectPassword(password.clone()))
    } else {
        Box::new(PromptPassword)
    };
    let password = source.get_password(&config.username)?;

    if config.save_password_to_keyring {
        if let Err(err) = store_in_keyring(&config.username, &password) {
            tracing::warn!(error = %err, "failed to seed keyring with password");
        } else {
            tracing::info!("password saved to the OS keyring; future runs can use --use-keyring");
        }
    }

    Ok(password)
}

fn build_notifier(config: &Config) -> Box<dyn Notifier> {
    if !config.notify.enabled() {
        return Box::new(NoopNotifier);
    }
    let notify = &config.notify;
    match SmtpNotifier::new(
        notify.smtp_host.as_deref().unwrap_or_default(),
        notify.smtp_port,
        notify.smtp_username.as_deref(),
        notify.smtp_password.as_deref(),
        notify.from.as_deref().unwrap_or_default(),
        notify.to.as_deref().unwrap_or_default(),
    ) {
        Ok(notifier) => Box::new(notifier),
        Err(err) => {
            tracing::warn!(error = %err, "failed to build SMTP notifier, notifications disabled");
            Box::new(NoopNotifier)
        }
    }
}

fn build_exif_writer(config: &Config) -> Arc<dyn ExifWriter> {
    if config.set_exif_datetime {
        Arc::new(LittleExifWriter)
    } else {
        Arc::new(NoopExifWriter)
    }
}

fn mfa_provider(config: &Config, status: &StatusExchange) -> MfaProvider {
    match config.mfa_provider {
        MfaProviderArg::Interactive => MfaProvider::Interactive,
        MfaProviderArg::WebUi => MfaProvider::WebUi(status.clone()),
    }
}

fn build_authenticator(config: &Config) -> Result<Arc<Authenticator>> {
    let password = resolve_password(config)?;
    let client = reqwest::Client::builder().user_agent("icloudpd-rs/0.1").build()?;
    let store = Arc::new(SessionStore::new(&config.cookie_directory)?);
    let authenticator = Arc::new(Authenticator::new(
        client,
        store,
        config.domain,
        config.username.clone(),
        password,
        config.client_id.clone(),
        config.http_timeout,
    ));

    let weak = Arc::downgrade(&authenticator);
    authenticator.transport().set_reauth_callback(Arc::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            let auth = weak.upgrade().ok_or_else(|| anyhow::anyhow!("authenticator dropped"))?;
            auth.login().await?;
            Ok(())
        })
    }));

    Ok(authenticator)
}

async fn login(config: &Config, authenticator: &Authenticator, notifier: &dyn Notifier, status: &StatusExchange) -> Result<serde_json::Value> {
    let provider = mfa_provider(config, status);
    let data = authenticator
        .login_with_mfa(&provider, || {
            notifier
                .notify(
                    "iCloud sync needs a two-factor code",
                    "Authentication requires a two-factor code. Supply one via the console or POST /api/mfa-code.",
                )
                .ok();
        })
        .await?;
    Ok(data)
}

fn build_photo_service(config: &Config, authenticator: &Authenticator, data: &serde_json::Value) -> Result<PhotoService> {
    let service_root = data
        .pointer("/webservices/ckdatabasews/url")
        .and_then(serde_json::Value::as_str)
        .ok_or(SyncError::ServiceNotActivated)?;
    let dsid = data.pointer("/dsInfo/dsid").and_then(serde_json::Value::as_str).unwrap_or_default();
    let client_id = authenticator.transport().client_id();
    Ok(PhotoService::new(
        authenticator.transport().clone(),
        service_root,
        dsid,
        &client_id,
        config.file_match_policy,
        config.raw_align_policy,
    ))
}

async fn run(config: Config) -> Result<()> {
    let authenticator = build_authenticator(&config)?;
    let status = StatusExchange::new();
    let notifier = build_notifier(&config);

    if config.auth_only {
        login(&config, &authenticator, notifier.as_ref(), &status).await?;
        tracing::info!("authenticated successfully, session persisted");
        return Ok(());
    }

    if config.list_albums || config.list_libraries {
        let data = login(&config, &authenticator, notifier.as_ref(), &status).await?;
        let photos = build_photo_service(&config, &authenticator, &data)?;
        if config.list_libraries {
            println!("{}", icloudpd_rs::photos::PRIMARY_ZONE);
        }
        if config.list_albums {
            let albums = photos.albums().await?;
            for album in albums {
                println!("{}", album.name);
            }
        }
        return Ok(());
    }

    let exif_writer = build_exif_writer(&config);
    let control = if config.ui.enabled {
        Some(ControlServer::spawn(&config.ui.bind, config.ui.port, status.clone()).await?)
    } else {
        None
    };

    let watch = WatchLoop::new(config, authenticator, notifier, exif_writer, status, control);
    watch.run().await
}
