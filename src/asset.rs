//! Asset model: filename computation and version table (spec ref: §4.4
//! Asset, §3 Data Model).
//!
//! Grounded in `pyicloud_ipd/services/photos.py::PhotoAsset`. The master
//! record carries static fields (filename, dimensions, item type); the
//! separate asset record carries per-occurrence fields (dates, version
//! resolution table). Keeping them as two `Value`s mirrors the original's
//! `_master_record`/`_asset_record` split instead of flattening into one
//! struct, since several fields genuinely only exist on one or the other.

use crate::util::{add_suffix_to_filename, clean_filename, normalize_id_prefix};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionSize {
    Original,
    Alternative,
    Medium,
    Thumb,
    Adjusted,
    LiveOriginal,
    LiveMedium,
    LiveThumb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Image,
    Movie,
}

/// Matches `FileMatchPolicy.NAME_ID7`: append a 7-character base64 slice of
/// the record id so that files which legitimately share a cloud filename
/// don't collide locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMatchPolicy {
    NameSizeDedupWithSuffix,
    NameId7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTreatmentPolicy {
    AsIs,
    AsOriginal,
    AsAlternative,
}

const ITEM_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("public.heic", "HEIC"),
    ("public.jpeg", "JPG"),
    ("public.png", "PNG"),
    ("com.apple.quicktime-movie", "MOV"),
    ("com.adobe.raw-image", "DNG"),
    ("com.canon.cr2-raw-image", "CR2"),
    ("com.canon.crw-raw-image", "CRW"),
    ("com.sony.arw-raw-image", "ARW"),
    ("com.fuji.raw-image", "RAF"),
    ("com.panasonic.rw2-raw-image", "RW2"),
    ("com.nikon.nrw-raw-image", "NRF"),
    ("com.pentax.raw-image", "PEF"),
    ("com.nikon.raw-image", "NEF"),
    ("com.olympus.raw-image", "ORF"),
    ("com.canon.cr3-raw-image", "CR3"),
    ("com.olympus.or-raw-image", "ORF"),
];

const ITEM_TYPES_MOVIE: &[&str] = &["com.apple.quicktime-movie"];

fn item_type_extension(item_type: &str) -> Option<&'static str> {
    ITEM_TYPE_EXTENSIONS.iter().find(|(k, _)| *k == item_type).map(|(_, v)| *v)
}

const PHOTO_VERSION_LOOKUP: &[(VersionSize, &str)] = &[
    (VersionSize::Original, "resOriginal"),
    (VersionSize::Alternative, "resOriginalAlt"),
    (VersionSize::Medium, "resJPEGMed"),
    (VersionSize::Thumb, "resJPEGThumb"),
    (VersionSize::Adjusted, "resJPEGFull"),
    (VersionSize::LiveOriginal, "resOriginalVidCompl"),
    (VersionSize::LiveMedium, "resVidMed"),
    (VersionSize::LiveThumb, "resVidSmall"),
];

const VIDEO_VERSION_LOOKUP: &[(VersionSize, &str)] = &[
    (VersionSize::Original, "resOriginal"),
    (VersionSize::Medium, "resVidMed"),
    (VersionSize::Thumb, "resVidSmall"),
];

const VERSION_FILENAME_SUFFIX_LOOKUP: &[(VersionSize, &str)] =
    &[(VersionSize::Medium, "medium"), (VersionSize::Thumb, "thumb")];

#[derive(Debug, Clone)]
pub struct AssetVersion {
    pub filename: String,
    pub size: u64,
    pub url: String,
    pub content_type: String,
}

pub struct PhotoAsset {
    pub master_record: Value,
    pub asset_record: Value,
    match_policy: FileMatchPolicy,
    raw_policy: RawTreatmentPolicy,
}

impl PhotoAsset {
    pub fn new(master_record: Value, asset_record: Value, match_policy: FileMatchPolicy, raw_policy: RawTreatmentPolicy) -> Self {
        Self { master_record, asset_record, match_policy, raw_policy }
    }

    pub fn id(&self) -> &str {
        self.master_record
            .pointer("/recordName")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn master_fields(&self) -> Option<&serde_json::Map<String, Value>> {
        self.master_record.get("fields").and_then(Value::as_object)
    }

    fn asset_fields(&self) -> Option<&serde_json::Map<String, Value>> {
        self.asset_record.get("fields").and_then(Value::as_object)
    }

    /// Decodes `filenameEnc` (STRING or base64 ENCRYPTED_BYTES), cleans it,
    /// and — under `NAME_ID7` — appends a short id suffix. Falls back to a
    /// normalized id prefix plus extension when no filename field exists at
    /// all (some photos genuinely have none).
    pub fn filename(&self) -> String {
        if let Some(fields) = self.master_fields() {
            if let Some(enc) = fields.get("filenameEnc") {
                if let Some(decoded) = decode_filename_enc(enc) {
                    let mut cleaned = clean_filename(&decoded);
                    if self.match_policy == FileMatchPolicy::NameId7 {
                        let suffix = STANDARD.encode(self.id().as_bytes());
                        let short = &suffix[..suffix.len().min(7)];
                        cleaned = add_suffix_to_filename(&format!("_{short}"), &cleaned);
                    }
                    return cleaned;
                }
            }
        }
        format!("{}.{}", normalize_id_prefix(self.id()), self.item_type_extension())
    }

    pub fn item_type(&self) -> Option<ItemType> {
        let raw = self.master_fields()?.get("itemType")?.get("value")?.as_str()?;
        if ITEM_TYPES_MOVIE.contains(&raw) {
            return Some(ItemType::Movie);
        }
        if item_type_extension(raw).is_some() {
            return Some(ItemType::Image);
        }
        let lower = self.filename().to_ascii_lowercase();
        if lower.ends_with(".heic") || lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            Some(ItemType::Image)
        } else {
            Some(ItemType::Movie)
        }
    }

    pub fn item_type_extension(&self) -> &'static str {
        self.master_fields()
            .and_then(|f| f.get("itemType"))
            .and_then(|v| v.get("value"))
            .and_then(Value::as_str)
            .and_then(item_type_extension)
            .unwrap_or("unknown")
    }

    pub fn size(&self) -> u64 {
        self.master_fields()
            .and_then(|f| f.get("resOriginalRes"))
            .and_then(|v| v.pointer("/value/size"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// `assetDate` in epoch milliseconds; falls back to the Unix epoch on a
    /// missing/malformed field, matching the original's bare `except`.
    pub fn asset_date(&self) -> OffsetDateTime {
        self.asset_fields()
            .and_then(|f| f.get("assetDate"))
            .and_then(|v| v.get("value"))
            .and_then(Value::as_f64)
            .and_then(|millis| OffsetDateTime::from_unix_timestamp((millis / 1000.0) as i64).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn added_date(&self) -> OffsetDateTime {
        self.asset_fields()
            .and_then(|f| f.get("addedDate"))
            .and_then(|v| v.get("value"))
            .and_then(Value::as_f64)
            .and_then(|millis| OffsetDateTime::from_unix_timestamp((millis / 1000.0) as i64).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn is_favorite(&self) -> bool {
        field_bool(self.asset_fields(), "isFavorite")
    }

    pub fn is_hidden(&self) -> bool {
        field_bool(self.asset_fields(), "isHidden")
    }

    /// Builds the per-size download table, swapping original/alternative
    /// when the configured raw policy calls for it.
    pub fn versions(&self, lp_filename_generator: impl Fn(&str) -> String) -> BTreeMap<VersionSize, AssetVersion> {
        let lookup: &[(VersionSize, &str)] = match self.item_type() {
            Some(ItemType::Movie) => VIDEO_VERSION_LOOKUP,
            _ => PHOTO_VERSION_LOOKUP,
        };

        let filename = self.filename();
        let mut versions = BTreeMap::new();

        for (key, prefix) in lookup {
            let res_key = format!("{prefix}Res");
            let fields = self
                .asset_fields()
                .filter(|f| f.contains_key(&res_key))
                .or_else(|| self.master_fields().filter(|f| f.contains_key(&res_key)));
            let Some(fields) = fields else { continue };

            let Some(size_entry) = fields.get(&res_key) else { continue };
            let size = size_entry.pointer("/value/size").and_then(Value::as_u64).unwrap_or(0);
            let url = size_entry.pointer("/value/downloadURL").and_then(Value::as_str).unwrap_or("").to_string();
            let content_type = fields
                .get(format!("{prefix}FileType").as_str())
                .and_then(|v| v.get("value"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            let mut version_filename = filename.clone();
            if matches!(self.item_type(), Some(ItemType::Image) | None) && content_type == "com.apple.quicktime-movie" {
                version_filename = lp_filename_generator(&filename);
            } else if let Some(ext) = item_type_extension(&content_type) {
                version_filename = replace_extension(&version_filename, ext);
            }

            if let Some((_, suffix)) = VERSION_FILENAME_SUFFIX_LOOKUP.iter().find(|(k, _)| k == key) {
                version_filename = add_suffix_to_filename(&format!("-{suffix}"), &version_filename);
            }

            versions.insert(*key, AssetVersion { filename: version_filename, size, url, content_type });
        }

        if let (Some(alt), Some(orig)) = (versions.get(&VersionSize::Alternative).cloned(), versions.get(&VersionSize::Original).cloned()) {
            let swap = (alt.content_type.contains("raw") && self.raw_policy == RawTreatmentPolicy::AsOriginal)
                || (orig.content_type.contains("raw") && self.raw_policy == RawTreatmentPolicy::AsAlternative);
            if swap {
                versions.insert(VersionSize::Alternative, orig);
                versions.insert(VersionSize::Original, alt);
            }
        }

        versions
    }
}

fn field_bool(fields: Option<&serde_json::Map<String, Value>>, key: &str) -> bool {
    fields
        .and_then(|f| f.get(key))
        .and_then(|v| v.get("value"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn decode_filename_enc(enc: &Value) -> Option<String> {
    let kind = enc.get("type").and_then(Value::as_str)?;
    let value = enc.get("value").and_then(Value::as_str)?;
    match kind {
        "STRING" => Some(value.to_string()),
        "ENCRYPTED_BYTES" => STANDARD.decode(value).ok().and_then(|bytes| String::from_utf8(bytes).ok()),
        _ => None,
    }
}

fn replace_extension(filename: &str, new_ext: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.{new_ext}"),
        None => format!("{filename}.{new_ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn asset_with_filename_enc(enc: Value) -> PhotoAsset {
        PhotoAsset::new(
            json!({"recordName": "ABCD1234", "fields": {"filenameEnc": enc, "itemType": {"value": "public.jpeg"}}}),
            json!({"fields": {}}),
            FileMatchPolicy::NameSizeDedupWithSuffix,
            RawTreatmentPolicy::AsIs,
        )
    }

    #[test]
    fn decodes_string_filename() {
        let asset = asset_with_filename_enc(json!({"type": "STRING", "value": "IMG_0001.JPG"}));
        assert_eq!(asset.filename(), "IMG_0001.JPG");
    }

    #[test]
    fn decodes_base64_filename() {
        let encoded = STANDARD.encode("IMG_0002.JPG");
        let asset = asset_with_filename_enc(json!({"type": "ENCRYPTED_BYTES", "value": encoded}));
        assert_eq!(asset.filename(), "IMG_0002.JPG");
    }

    #[test]
    fn name_id7_policy_appends_suffix() {
        let mut asset = asset_with_filename_enc(json!({"type": "STRING", "value": "IMG_0003.JPG"}));
        asset.match_policy = FileMatchPolicy::NameId7;
        let name = asset.filename();
        assert!(name.starts_with("IMG_0003_"));
        assert!(name.ends_with(".JPG"));
    }

    #[test]
    fn falls_back_to_id_prefix_when_no_filename_enc() {
        let asset = PhotoAsset::new(
            json!({"recordName": "zz-weird/id", "fields": {"itemType": {"value": "public.heic"}}}),
            json!({"fields": {}}),
            FileMatchPolicy::NameSizeDedupWithSuffix,
            RawTreatmentPolicy::AsIs,
        );
        assert_eq!(asset.filename(), "zz_weird_id.HEIC");
    }

    #[test]
    fn movie_item_type_uses_video_lookup() {
        let asset = PhotoAsset::new(
            json!({"recordName": "id1", "fields": {
                "itemType": {"value": "com.apple.quicktime-movie"},
                "resOriginalRes": {"value": {"size": 100, "downloadURL": "https://example/orig"}},
                "resOriginalFileType": {"value": "com.apple.quicktime-movie"},
            }}),
            json!({"fields": {}}),
            FileMatchPolicy::NameSizeDedupWithSuffix,
            RawTreatmentPolicy::AsIs,
        );
        let versions = asset.versions(|name| format!("{name}_live"));
        assert!(versions.contains_key(&VersionSize::Original));
    }

    #[test]
    fn raw_policy_swaps_original_and_alternative() {
        let asset = PhotoAsset::new(
            json!({"recordName": "id2", "fields": {
                "itemType": {"value": "public.jpeg"},
                "resOriginalRes": {"value": {"size": 10, "downloadURL": "https://example/o"}},
                "resOriginalFileType": {"value": "public.jpeg"},
                "resOriginalAltRes": {"value": {"size": 20, "downloadURL": "https://example/a"}},
                "resOriginalAltFileType": {"value": "com.adobe.raw-image"},
            }}),
            json!({"fields": {}}),
            FileMatchPolicy::NameSizeDedupWithSuffix,
            RawTreatmentPolicy::AsOriginal,
        );
        let versions = asset.versions(|name| name.to_string());
        assert!(versions[&VersionSize::Original].content_type.contains("raw"));
    }
}
