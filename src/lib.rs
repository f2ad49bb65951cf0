pub mod asset;
pub mod auth;
pub mod command;
pub mod config;
pub mod download;
pub mod error;
pub mod exif;
pub mod heic;
pub mod notify;
pub mod password;
pub mod photos;
pub mod session;
pub mod srp;
pub mod status;
pub mod sync;
pub mod transport;
pub mod upload;
pub mod util;
pub mod watch;

pub use config::{Cli, Config};

pub type Result<T> = anyhow::Result<T>;
