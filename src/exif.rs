//! EXIF backfill for downloaded assets (spec ref: SPEC_FULL.md §1 ambient
//! stack "ExifWriter"; --set-exif-datetime).
//!
//! iCloud serves the original file bytes unmodified, so a photo whose
//! camera never wrote `DateTimeOriginal` (screenshots, some third-party
//! imports) keeps lacking it locally too. This writer backfills that one
//! tag from the asset's iCloud-reported creation date, the way the
//! teacher's collaborator traits wrap a single narrowly-scoped library
//! call behind a small trait so `sync.rs` doesn't need to know which EXIF
//! crate is in use.

use anyhow::{Context, Result};
use little_exif::exif_tag::ExifTag;
use little_exif::metadata::Metadata;
use std::path::Path;
use time::OffsetDateTime;

pub trait ExifWriter: Send + Sync {
    /// Writes `DateTimeOriginal` into `path` if the file has no such tag
    /// already. No-ops for formats the implementation doesn't understand.
    fn backfill_datetime(&self, path: &Path, created: OffsetDateTime) -> Result<()>;
}

/// Writes via `little_exif`, which the pack already depends on for
/// JPEG/HEIC/TIFF metadata editing in place.
pub struct LittleExifWriter;

impl ExifWriter for LittleExifWriter {
    fn backfill_datetime(&self, path: &Path, created: OffsetDateTime) -> Result<()> {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default().to_ascii_lowercase();
        if !matches!(extension.as_str(), "jpg" | "jpeg" | "heic" | "tiff" | "tif") {
            return Ok(());
        }

        let mut metadata = Metadata::new_from_path(path).with_context(|| format!("reading EXIF metadata from {}", path.display()))?;
        if metadata.get_tag(&ExifTag::DateTimeOriginal(String::new())).next().is_some() {
            return Ok(());
        }

        let stamp = format_exif_datetime(created);
        metadata.set_tag(ExifTag::DateTimeOriginal(stamp));
        metadata.write_to_file(path).with_context(|| format!("writing EXIF metadata to {}", path.display()))?;
        Ok(())
    }
}

/// Used when `--set-exif-datetime` is not passed.
pub struct NoopExifWriter;

impl ExifWriter for NoopExifWriter {
    fn backfill_datetime(&self, _path: &Path, _created: OffsetDateTime) -> Result<()> {
        Ok(())
    }
}

fn format_exif_datetime(value: OffsetDateTime) -> String {
    format!(
        "{:04}:{:02}:{:02} {:02}:{:02}:{:02}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_exif_datetime_with_colon_separators() {
        let stamp = format_exif_datetime(datetime!(2023-05-07 14:03:09 UTC));
        assert_eq!(stamp, "2023:05:07 14:03:09");
    }

    #[test]
    fn noop_writer_never_touches_the_file() {
        let writer = NoopExifWriter;
        assert!(writer.backfill_datetime(Path::new("/does/not/exist.jpg"), datetime!(2023-01-01 00:00:00 UTC)).is_ok());
    }
}
