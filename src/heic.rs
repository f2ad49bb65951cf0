//! HEIC conversion hook (spec ref: SPEC_FULL.md §1 ambient stack,
//! "HeicConverter"). HEIC transcoding itself is out of scope (spec.md
//! Non-goals), but the collaborator seam is still ambient plumbing every
//! other trait in this crate follows, so `SyncDriver` can call through it
//! unconditionally and simply get a passthrough until a real converter is
//! configured.

use anyhow::Result;
use std::path::Path;

pub trait HeicConverter: Send + Sync {
    /// Converts `source` to JPEG, returning the path of the converted file.
    /// Implementations that don't convert return `source` unchanged.
    fn convert_to_jpeg(&self, source: &Path) -> Result<std::path::PathBuf>;
}

/// Leaves HEIC files as downloaded. This crate does not bundle a HEIF
/// decoder; wiring a real one in is future work, not something SPEC_FULL.md
/// asks for.
pub struct PassthroughHeicConverter;

impl HeicConverter for PassthroughHeicConverter {
    fn convert_to_jpeg(&self, source: &Path) -> Result<std::path::PathBuf> {
        Ok(source.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_returns_the_same_path() {
        let converter = PassthroughHeicConverter;
        let path = Path::new("/tmp/IMG_0001.HEIC");
        assert_eq!(converter.convert_to_jpeg(path).unwrap(), path);
    }
}
