use anyhow::{Context, Result, bail};
use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};
use time::UtcOffset;

pub fn expand_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Ok(path.to_path_buf());
    }
    let path_str = path.to_string_lossy();
    let expanded = if let Some(stripped) = path_str.strip_prefix('~') {
        let base = directories::BaseDirs::new()
            .context("unable to resolve home directory for path expansion")?
            .home_dir()
            .to_path_buf();
        let stripped = stripped.trim_start_matches(['/', '\\']);
        if stripped.is_empty() {
            base
        } else {
            base.join(stripped)
        }
    } else {
        path.to_path_buf()
    };
    expanded
        .absolutize()
        .map(|p| p.to_path_buf())
        .context("failed to absolutize path")
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        bail!("{} exists but is not a directory", path.display());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))?;
    Ok(())
}

/// Creates a directory restricted to the owning user (mode 0700 on unix),
/// per the SessionStore invariant that cookie/session directories deny
/// group/other access.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    ensure_dir(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Best-effort local UTC offset, captured once at process start before any
/// additional threads are spawned. `time`'s local-offset lookup is only
/// sound to call this early; callers thread the value through rather than
/// re-querying it per asset.
pub fn local_utc_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

/// Strips characters that are unsafe in filenames on common filesystems,
/// mirroring the reserved-character set the original cleaner rejects.
pub fn clean_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Inserts `suffix` right before the file extension, matching
/// `add_suffix_to_filename` in the original (`name.ext` -> `name<suffix>.ext`).
pub fn add_suffix_to_filename(suffix: &str, filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && !ext.contains('/') => {
            format!("{stem}{suffix}.{ext}")
        }
        _ => format!("{filename}{suffix}"),
    }
}

/// First 12 alphanumeric-normalized characters of a record id, used to
/// synthesize a filename when `filenameEnc` is absent.
pub fn normalize_id_prefix(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(12)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_filename_replaces_reserved_chars() {
        assert_eq!(clean_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn clean_filename_is_idempotent() {
        let once = clean_filename("weird<name>.jpg");
        let twice = clean_filename(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn add_suffix_before_extension() {
        assert_eq!(add_suffix_to_filename("-medium", "IMG_1234.JPG"), "IMG_1234-medium.JPG");
        assert_eq!(add_suffix_to_filename("-thumb", "noext"), "noext-thumb");
    }

    #[test]
    fn normalize_id_prefix_truncates_and_strips() {
        assert_eq!(normalize_id_prefix("AB-12/34_cdEFGHIJKLMN"), "AB_12_34_cdE");
    }
}
