//! SyncDriver: one full pass over a selected album (spec ref: §4.6
//! SyncDriver).
//!
//! Grounded in `icloudpd/base.py::core` and `icloudpd/download.py`'s
//! existence-probing helpers. The per-asset loop, `until-found` early exit,
//! `probeExistence`'s legacy/size-suffixed fallback, and the
//! delete-after-download guard are carried over; `AutoDeleter` and the
//! malformed-record dump are additive per SPEC_FULL.md's `original_source`
//! supplement.

use crate::asset::{ItemType, PhotoAsset, VersionSize};
use crate::auth::Authenticator;
use crate::config::Config;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::SyncError;
use crate::exif::ExifWriter;
use crate::photos::{AlbumDescriptor, PhotoService, PRIMARY_ZONE};
use crate::util::add_suffix_to_filename;
use anyhow::{Context, Result, bail};
use reqwest::Method;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::{OffsetDateTime, UtcOffset};

const ERROR_DUMP_PATH: &str = "icloudpd-photo-error.json";

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    pub downloaded: u64,
    pub already_existed: u64,
    pub download_errors: u64,
    pub cancelled: bool,
    /// Number of assets the album reported at the start of this pass
    /// (spec ref: §3 Progress, `totalCount`).
    pub total_count: u64,
    /// Number of assets actually paged through and examined this pass
    /// (may be less than `total_count` under `--until-found`/`--recent`,
    /// or a `stop` command; spec ref: §3 Progress, `checkedCount`).
    pub checked_count: u64,
}

impl SyncOutcome {
    /// Assets this pass saw but did not yet download or confirm existing,
    /// because the pass stopped early (spec ref: §3 Progress, `toDownloadCount`).
    pub fn to_download_count(&self) -> u64 {
        self.total_count.saturating_sub(self.checked_count)
    }
}

pub struct SyncDriver {
    config: Config,
    photos: PhotoService,
    downloader: Downloader,
    authenticator: std::sync::Arc<Authenticator>,
    exif_writer: std::sync::Arc<dyn ExifWriter>,
    local_offset: UtcOffset,
}

impl SyncDriver {
    pub fn new(
        config: Config,
        photos: PhotoService,
        downloader: Downloader,
        authenticator: std::sync::Arc<Authenticator>,
        exif_writer: std::sync::Arc<dyn ExifWriter>,
        local_offset: UtcOffset,
    ) -> Self {
        Self { config, photos, downloader, authenticator, exif_writer, local_offset }
    }

    /// Runs one full pass. `cancel` is polled between assets and at the top
    /// of the delete-after-download path so a WatchLoop `stop` command can
    /// interrupt a long-running sync (spec ref: §5 Cancellation).
    pub async fn run(&self, cancel: &AtomicBool, force_full: bool) -> Result<SyncOutcome> {
        if self.config.library != PRIMARY_ZONE {
            bail!("library '{}' is not supported; only '{}' is available", self.config.library, PRIMARY_ZONE);
        }

        let zone = json!({"zoneName": PRIMARY_ZONE});
        self.photos.ensure_library_ready(&zone).await?;

        let descriptor = self.resolve_album().await?;
        let page_size = 100usize;

        let mut outcome = SyncOutcome::default();
        outcome.total_count = self.photos.album_count(&descriptor).await.unwrap_or_default();

        let mut iter = self.photos.album_iterator(descriptor, page_size);

        let until_found = if force_full { None } else { self.config.until_found };
        let recent = if force_full { None } else { self.config.recent };

        let mut consumed = 0u64;
        let mut consecutive_existing = 0u64;

        loop {
            if cancel.load(Ordering::SeqCst) {
                outcome.cancelled = true;
                break;
            }
            if let Some(limit) = recent {
                if consumed >= limit {
                    break;
                }
            }

            let asset = match iter.next().await {
                Ok(Some(asset)) => asset,
                Ok(None) => break,
                Err(err) => return Err(err.into()),
            };
            consumed += 1;

            if asset.id().is_empty() {
                dump_malformed_record(&asset).ok();
                continue;
            }

            if self.should_skip_terminal(&asset) {
                continue;
            }
            if self.should_skip_by_date(&asset) {
                continue;
            }

            let created_local = asset.asset_date().to_offset(self.local_offset);
            let date_path = format_folder_template(&self.config.folder_structure, created_local);
            let download_dir = join_non_empty(&self.config.directory, &date_path);

            let downloaded_any = self.sync_asset(&asset, &download_dir, created_local, &mut outcome, &mut consecutive_existing).await?;

            if downloaded_any && self.config.delete_after_download {
                if !cancel.load(Ordering::SeqCst) {
                    self.maybe_delete_remote(&asset).await;
                }
            }

            if let Some(limit) = until_found {
                if consecutive_existing >= limit {
                    tracing::info!(count = consecutive_existing, "found N consecutive existing assets, stopping");
                    break;
                }
            }
        }

        outcome.checked_count = consumed;

        if self.config.auto_delete && !outcome.cancelled {
            if let Err(err) = self.auto_delete().await {
                tracing::error!(error = %err, "auto-delete pass failed");
            }
        }

        Ok(outcome)
    }

    async fn resolve_album(&self) -> Result<AlbumDescriptor> {
        let albums = self.photos.albums().await?;
        albums
            .into_iter()
            .find(|a| a.name == self.config.album)
            .with_context(|| format!("album '{}' was not found", self.config.album))
    }

    pub async fn list_albums(&self) -> Result<Vec<String>> {
        Ok(self.photos.albums().await?.into_iter().map(|a| a.name).collect())
    }

    fn should_skip_terminal(&self, asset: &PhotoAsset) -> bool {
        match asset.item_type() {
            Some(ItemType::Movie) if self.config.skip_videos => true,
            Some(ItemType::Image) if self.config.skip_photos => true,
            _ => false,
        }
    }

    fn should_skip_by_date(&self, asset: &PhotoAsset) -> bool {
        let created = asset.asset_date();
        if let Some(before) = self.config.skip_created_before {
            if created < before {
                return true;
            }
        }
        if let Some(after) = self.config.skip_created_after {
            if created >= after {
                return true;
            }
        }
        false
    }

    async fn sync_asset(
        &self,
        asset: &PhotoAsset,
        download_dir: &Path,
        created_local: OffsetDateTime,
        outcome: &mut SyncOutcome,
        consecutive_existing: &mut u64,
    ) -> Result<bool> {
        let versions = asset.versions(live_photo_filename);
        let mut downloaded_any = false;
        let has_live_photo = [VersionSize::LiveOriginal, VersionSize::LiveMedium, VersionSize::LiveThumb]
            .iter()
            .any(|size| versions.contains_key(size));

        for &requested in &self.config.sizes {
            let real_size = if !versions.contains_key(&requested) && requested != VersionSize::Original {
                if self.config.force_size {
                    tracing::info!(size = ?requested, id = asset.id(), "requested size unavailable, --force-size set, skipping");
                    continue;
                }
                VersionSize::Original
            } else {
                requested
            };
            let Some(version) = versions.get(&real_size) else {
                continue;
            };

            let existed = self.download_one(download_dir, &version.filename, version.size, &version.url, created_local, outcome).await?;
            downloaded_any = downloaded_any || !existed;
            if existed {
                *consecutive_existing += 1;
            } else {
                *consecutive_existing = 0;
            }
        }

        if has_live_photo && !self.config.skip_live_photos {
            if let Some(version) = versions.get(&self.live_photo_size_key()) {
                let existed = self.download_one(download_dir, &version.filename, version.size, &version.url, created_local, outcome).await?;
                downloaded_any = downloaded_any || !existed;
            }
        }

        Ok(downloaded_any)
    }

    fn live_photo_size_key(&self) -> VersionSize {
        self.config.live_photo_size
    }

    async fn download_one(
        &self,
        download_dir: &Path,
        filename: &str,
        expected_size: u64,
        url: &str,
        created_local: OffsetDateTime,
        outcome: &mut SyncOutcome,
    ) -> Result<bool> {
        if let Some(existing) = probe_existence(download_dir, filename, expected_size) {
            tracing::debug!(path = %existing.display(), "already exists");
            outcome.already_existed += 1;
            return Ok(true);
        }

        let target = if download_dir.join(filename).exists() {
            download_dir.join(add_suffix_to_filename(&format!("-{expected_size}"), filename))
        } else {
            download_dir.join(filename)
        };

        if self.config.only_print_filenames {
            println!("{}", target.display());
            return Ok(false);
        }
        if url.is_empty() {
            tracing::warn!(file = %target.display(), "asset has no download URL for this size");
            outcome.download_errors += 1;
            return Ok(false);
        }

        let authenticator = self.authenticator.clone();
        let reauth = move || {
            let authenticator = authenticator.clone();
            async move { authenticator.login().await.map(|_| ()).map_err(anyhow::Error::from) }
        };

        match self.downloader.download_media(url, &target, created_local, reauth).await? {
            DownloadOutcome::Downloaded => {
                outcome.downloaded += 1;
                if self.config.set_exif_datetime && is_jpeg_like(&target) {
                    if let Err(err) = self.exif_writer.backfill_datetime(&target, created_local) {
                        tracing::warn!(error = %err, path = %target.display(), "failed to backfill EXIF datetime");
                    }
                }
                Ok(false)
            }
            DownloadOutcome::DryRun => Ok(false),
            DownloadOutcome::MissingUrl | DownloadOutcome::IoError => {
                outcome.download_errors += 1;
                Ok(false)
            }
        }
    }

    async fn maybe_delete_remote(&self, asset: &PhotoAsset) {
        if let Some(days) = self.config.keep_icloud_recent_days {
            let age = OffsetDateTime::now_utc() - asset.asset_date();
            if age.whole_days() < days {
                tracing::info!(id = asset.id(), age_days = age.whole_days(), "asset is within keep-icloud-recent-days, not deleting remotely");
                return;
            }
        }
        if self.config.dry_run {
            tracing::info!(id = asset.id(), "dry-run: would delete remotely after download");
            return;
        }
        if let Err(err) = self.delete_remote(asset).await {
            tracing::error!(error = %err, id = asset.id(), "failed to delete remote asset after download");
        }
    }

    async fn delete_remote(&self, asset: &PhotoAsset) -> Result<(), SyncError> {
        let record_name = asset
            .asset_record
            .get("recordName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let change_tag = asset
            .asset_record
            .get("recordChangeTag")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = json!({
            "operations": [{
                "operationType": "update",
                "record": {
                    "fields": {"isDeleted": {"value": 1}},
                    "recordChangeTag": change_tag,
                    "recordName": record_name,
                    "recordType": "CPLAsset",
                },
            }],
            "zoneID": {"zoneName": PRIMARY_ZONE},
        });
        let url = self.photos.modify_url();
        self.authenticator.transport().request_json(Method::POST, &url, Some(&body), &[]).await?;
        Ok(())
    }

    /// Walks `Recently Deleted`, removing any locally-downloaded copy of
    /// assets that no longer exist in the library (spec ref: §4.6
    /// AutoDeleter).
    async fn auto_delete(&self) -> Result<()> {
        let descriptor = AlbumDescriptor {
            name: "Recently Deleted".to_string(),
            obj_type: "CPLAssetDeletedByExpungedDate".to_string(),
            list_type: "CPLAssetAndMasterDeletedByExpungedDate".to_string(),
            query_filter: None,
        };
        let mut iter = self.photos.album_iterator(descriptor, 100);
        while let Some(asset) = iter.next().await? {
            let created_local = asset.asset_date().to_offset(self.local_offset);
            let date_path = format_folder_template(&self.config.folder_structure, created_local);
            let download_dir = join_non_empty(&self.config.directory, &date_path);
            let versions = asset.versions(live_photo_filename);
            for version in versions.values() {
                let path = download_dir.join(&version.filename);
                if !path.exists() {
                    continue;
                }
                if self.config.dry_run {
                    tracing::info!(path = %path.display(), "dry-run: would delete locally (removed from iCloud)");
                    continue;
                }
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::error!(error = %err, path = %path.display(), "failed to remove locally-deleted asset");
                } else {
                    tracing::info!(path = %path.display(), "removed (deleted from iCloud)");
                }
            }
        }
        Ok(())
    }
}

fn is_jpeg_like(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("jpg") | Some("jpeg")
    )
}

fn live_photo_filename(base: &str) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("heic") => format!("{stem}_HEVC.MOV"),
        Some((stem, _)) => format!("{stem}.MOV"),
        None => format!("{base}.MOV"),
    }
}

fn join_non_empty(base: &Path, sub: &str) -> PathBuf {
    if sub.is_empty() {
        base.to_path_buf()
    } else {
        base.join(sub)
    }
}

/// `target`'s size match, a legacy `-original` suffix, or a size-suffixed
/// sibling; any match is treated as "already downloaded" (spec ref: §4.6
/// probeExistence).
fn probe_existence(directory: &Path, filename: &str, expected_size: u64) -> Option<PathBuf> {
    let direct = directory.join(filename);
    if file_size_matches(&direct, expected_size) {
        return Some(direct);
    }
    let legacy = directory.join(add_suffix_to_filename("-original", filename));
    if file_size_matches(&legacy, expected_size) {
        return Some(legacy);
    }
    let sized = directory.join(add_suffix_to_filename(&format!("-{expected_size}"), filename));
    if file_size_matches(&sized, expected_size) {
        return Some(sized);
    }
    None
}

fn file_size_matches(path: &Path, expected_size: u64) -> bool {
    std::fs::metadata(path).map(|m| m.len() == expected_size).unwrap_or(false)
}

fn dump_malformed_record(asset: &PhotoAsset) -> Result<()> {
    let payload = json!({"master": asset.master_record, "asset": asset.asset_record});
    std::fs::write(ERROR_DUMP_PATH, serde_json::to_vec_pretty(&payload)?)?;
    tracing::error!(path = ERROR_DUMP_PATH, "asset record was missing an id, dumped for inspection");
    Ok(())
}

/// Renders a strftime-like subset (`%Y %m %d %H %M %S`) against a local
/// datetime. `"none"` disables date-based subfolders entirely.
pub fn format_folder_template(template: &str, value: OffsetDateTime) -> String {
    if template.eq_ignore_ascii_case("none") {
        return String::new();
    }
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", value.year())),
            Some('m') => out.push_str(&format!("{:02}", u8::from(value.month()))),
            Some('d') => out.push_str(&format!("{:02}", value.day())),
            Some('H') => out.push_str(&format!("{:02}", value.hour())),
            Some('M') => out.push_str(&format!("{:02}", value.minute())),
            Some('S') => out.push_str(&format!("{:02}", value.second())),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_year_month_day_template() {
        let value = datetime!(2024-03-07 00:00:00 UTC);
        assert_eq!(format_folder_template("%Y/%m/%d", value), "2024/03/07");
    }

    #[test]
    fn none_template_disables_subfolders() {
        assert_eq!(format_folder_template("none", datetime!(2024-01-01 00:00:00 UTC)), "");
    }

    #[test]
    fn live_photo_filename_swaps_extension() {
        assert_eq!(live_photo_filename("IMG_0001.JPG"), "IMG_0001.MOV");
    }

    #[test]
    fn live_photo_filename_heic_swaps_to_hevc_mov() {
        assert_eq!(live_photo_filename("IMG_0001.HEIC"), "IMG_0001_HEVC.MOV");
        assert_eq!(live_photo_filename("IMG_0001.heic"), "IMG_0001_HEVC.MOV");
    }

    #[test]
    fn probe_existence_matches_legacy_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IMG_0001-original.JPG"), b"12345").unwrap();
        let found = probe_existence(dir.path(), "IMG_0001.JPG", 5);
        assert!(found.is_some());
    }

    #[test]
    fn probe_existence_returns_none_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        assert!(probe_existence(dir.path(), "IMG_0002.JPG", 5).is_none());
    }
}
