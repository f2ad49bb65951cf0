//! PhotoService / PhotoLibrary / PhotoAlbum (spec ref: §4.3 PhotoService).
//!
//! Grounded in `pyicloud_ipd/services/photos.py`. The smart-album table,
//! the `CheckIndexingState` gate, the `HyperionIndexCountLookup` count
//! query, and the `CPLAsset`/`CPLMaster` pairing-by-`startRank` pagination
//! are carried over essentially unchanged; only custom (non-smart) album
//! subfolder traversal is in scope here since `original_source` shows it
//! already marked `FIXME: Handle subfolders` upstream.

use crate::asset::{FileMatchPolicy, PhotoAsset, RawTreatmentPolicy};
use crate::error::SyncError;
use crate::transport::Transport;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Method;
use serde_json::{json, Value};

pub const PRIMARY_ZONE: &str = "PrimarySync";

struct SmartFolder {
    name: &'static str,
    obj_type: &'static str,
    list_type: &'static str,
    query_filter: Option<Value>,
}

fn smart_album_filter(field_value: &str) -> Value {
    json!([{
        "fieldName": "smartAlbum",
        "comparator": "EQUALS",
        "fieldValue": {"type": "STRING", "value": field_value},
    }])
}

fn smart_folders() -> Vec<SmartFolder> {
    vec![
        SmartFolder {
            name: "All Photos",
            obj_type: "CPLAssetByAssetDateWithoutHiddenOrDeleted",
            list_type: "CPLAssetAndMasterByAssetDateWithoutHiddenOrDeleted",
            query_filter: None,
        },
        SmartFolder {
            name: "Time-lapse",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Timelapse",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("TIMELAPSE")),
        },
        SmartFolder {
            name: "Videos",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Video",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("VIDEO")),
        },
        SmartFolder {
            name: "Slo-mo",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Slomo",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("SLOMO")),
        },
        SmartFolder {
            name: "Bursts",
            obj_type: "CPLAssetBurstStackAssetByAssetDate",
            list_type: "CPLBurstStackAssetAndMasterByAssetDate",
            query_filter: None,
        },
        SmartFolder {
            name: "Favorites",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Favorite",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("FAVORITE")),
        },
        SmartFolder {
            name: "Panoramas",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Panorama",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("PANORAMA")),
        },
        SmartFolder {
            name: "Screenshots",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Screenshot",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("SCREENSHOT")),
        },
        SmartFolder {
            name: "Live",
            obj_type: "CPLAssetInSmartAlbumByAssetDate:Live",
            list_type: "CPLAssetAndMasterInSmartAlbumByAssetDate",
            query_filter: Some(smart_album_filter("LIVE")),
        },
        SmartFolder {
            name: "Recently Deleted",
            obj_type: "CPLAssetDeletedByExpungedDate",
            list_type: "CPLAssetAndMasterDeletedByExpungedDate",
            query_filter: None,
        },
        SmartFolder {
            name: "Hidden",
            obj_type: "CPLAssetHiddenByAssetDate",
            list_type: "CPLAssetAndMasterHiddenByAssetDate",
            query_filter: None,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct AlbumDescriptor {
    pub name: String,
    pub obj_type: String,
    pub list_type: String,
    pub query_filter: Option<Value>,
}

pub struct PhotoService {
    transport: Transport,
    service_endpoint: String,
    params: Value,
    match_policy: FileMatchPolicy,
    raw_policy: RawTreatmentPolicy,
}

impl PhotoService {
    pub fn new(transport: Transport, service_root: &str, dsid: &str, client_id: &str, match_policy: FileMatchPolicy, raw_policy: RawTreatmentPolicy) -> Self {
        let service_endpoint = format!("{}/database/1/com.apple.photos.cloud/production/private", service_root.trim_end_matches('/'));
        let params = json!({
            "clientBuildNumber": "17DHotfix5",
            "clientMasteringNumber": "17DHotfix5",
            "ckjsBuildVersion": "17DProjectDev77",
            "ckjsVersion": "2.0.5",
            "clientId": client_id,
            "dsid": dsid,
            "remapEnums": true,
            "getCurrentSyncToken": true,
        });
        Self { transport, service_endpoint, params, match_policy, raw_policy }
    }

    fn query_url(&self) -> String {
        format!("{}/records/query?{}", self.service_endpoint, self.encoded_params())
    }

    /// `records/modify` endpoint, used by the SyncDriver's delete-after-download path.
    pub fn modify_url(&self) -> String {
        format!("{}/records/modify?{}", self.service_endpoint, self.encoded_params())
    }

    fn encoded_params(&self) -> String {
        self.params
            .as_object()
            .into_iter()
            .flatten()
            .map(|(k, v)| format!("{k}={}", urlencoding_value(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Checks `CheckIndexingState` against the primary zone, erroring out
    /// with `ServiceNotActivated` until Apple reports `FINISHED`.
    pub async fn ensure_library_ready(&self, zone: &Value) -> Result<(), SyncError> {
        let body = json!({"query": {"recordType": "CheckIndexingState"}, "zoneID": zone});
        let response = self.transport.request_json(Method::POST, &self.query_url(), Some(&body), &[]).await?;
        let state = response
            .body
            .pointer("/records/0/fields/state/value")
            .and_then(Value::as_str)
            .unwrap_or("");
        if state != "FINISHED" {
            return Err(SyncError::ServiceNotActivated);
        }
        Ok(())
    }

    /// All known albums for the primary library: the fixed smart-folder
    /// table plus any user-created folder discovered via
    /// `CPLAlbumByPositionLive`.
    pub async fn albums(&self) -> Result<Vec<AlbumDescriptor>, SyncError> {
        let mut albums: Vec<AlbumDescriptor> = smart_folders()
            .into_iter()
            .map(|f| AlbumDescriptor {
                name: f.name.to_string(),
                obj_type: f.obj_type.to_string(),
                list_type: f.list_type.to_string(),
                query_filter: f.query_filter,
            })
            .collect();

        let zone = json!({"zoneName": PRIMARY_ZONE});
        let body = json!({"query": {"recordType": "CPLAlbumByPositionLive"}, "zoneID": zone});
        let response = self.transport.request_json(Method::POST, &self.query_url(), Some(&body), &[]).await?;
        let records = response.body.get("records").and_then(Value::as_array).cloned().unwrap_or_default();

        for folder in records {
            let record_name = folder.get("recordName").and_then(Value::as_str).unwrap_or("");
            if record_name == "----Root-Folder----" || record_name == "----Project-Root-Folder----" {
                continue;
            }
            let is_deleted = folder.pointer("/fields/isDeleted/value").and_then(Value::as_bool).unwrap_or(false);
            if is_deleted {
                continue;
            }
            let Some(name_enc) = folder.pointer("/fields/albumNameEnc/value").and_then(Value::as_str) else { continue };
            let Ok(decoded) = STANDARD.decode(name_enc) else { continue };
            let Ok(name) = String::from_utf8(decoded) else { continue };

            albums.push(AlbumDescriptor {
                name,
                obj_type: format!("CPLContainerRelationNotDeletedByAssetDate:{record_name}"),
                list_type: "CPLContainerRelationLiveByAssetDate".to_string(),
                query_filter: Some(json!([{
                    "fieldName": "parentId",
                    "comparator": "EQUALS",
                    "fieldValue": {"type": "STRING", "value": record_name},
                }])),
            });
        }

        Ok(albums)
    }

    /// `HyperionIndexCountLookup` total for one album's `obj_type`.
    pub async fn album_count(&self, descriptor: &AlbumDescriptor) -> Result<u64, SyncError> {
        let zone = json!({"zoneName": PRIMARY_ZONE});
        let body = json!({
            "batch": [{
                "resultsLimit": 1,
                "query": {
                    "filterBy": {
                        "fieldName": "indexCountID",
                        "fieldValue": {"type": "STRING_LIST", "value": [descriptor.obj_type]},
                        "comparator": "IN",
                    },
                    "recordType": "HyperionIndexCountLookup",
                },
                "zoneWide": true,
                "zoneID": zone,
            }],
        });
        let url = format!("{}/internal/records/query/batch?{}", self.service_endpoint, self.encoded_params());
        let response = self.transport.request_json(Method::POST, &url, Some(&body), &[]).await?;
        Ok(response
            .body
            .pointer("/batch/0/records/0/fields/itemCount/value")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Fetches one page of `(master_record, asset_record)` pairs starting
    /// at `offset`, returning the pairs and the offset to resume from (or
    /// `None` once the server stops returning master records).
    pub async fn fetch_page(&self, descriptor: &AlbumDescriptor, offset: i64, page_size: usize) -> Result<(Vec<(Value, Value)>, Option<i64>), SyncError> {
        let zone = json!({"zoneName": PRIMARY_ZONE});
        let mut filter_by = vec![
            json!({"fieldName": "startRank", "fieldValue": {"type": "INT64", "value": offset}, "comparator": "EQUALS"}),
            json!({"fieldName": "direction", "fieldValue": {"type": "STRING", "value": "ASCENDING"}, "comparator": "EQUALS"}),
        ];
        if let Some(extra) = &descriptor.query_filter {
            if let Some(items) = extra.as_array() {
                filter_by.extend(items.iter().cloned());
            }
        }

        let body = json!({
            "query": {"filterBy": filter_by, "recordType": descriptor.list_type},
            "resultsLimit": page_size * 2,
            "desiredKeys": DESIRED_KEYS,
            "zoneID": zone,
        });

        let response = self.transport.request_json(Method::POST, &self.query_url(), Some(&body), &[]).await?;
        let records = response.body.get("records").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut asset_records = std::collections::HashMap::new();
        let mut master_records = Vec::new();
        for record in records {
            match record.get("recordType").and_then(Value::as_str) {
                Some("CPLAsset") => {
                    if let Some(master_id) = record.pointer("/fields/masterRef/value/recordName").and_then(Value::as_str) {
                        asset_records.insert(master_id.to_string(), record);
                    }
                }
                Some("CPLMaster") => master_records.push(record),
                _ => {}
            }
        }

        if master_records.is_empty() {
            return Ok((Vec::new(), None));
        }

        let next_offset = offset + master_records.len() as i64;
        let mut pairs = Vec::with_capacity(master_records.len());
        for master in master_records {
            let record_name = master.get("recordName").and_then(Value::as_str).unwrap_or("").to_string();
            let asset = asset_records.remove(&record_name).unwrap_or(json!({"fields": {}}));
            pairs.push((master, asset));
        }

        Ok((pairs, Some(next_offset)))
    }

    /// Drives `fetch_page` to exhaustion, constructing a `PhotoAsset` per
    /// pair as it comes in. Convenience wrapper over `AlbumIterator` for
    /// call sites (tests, `--list-albums`-adjacent tooling) that want the
    /// whole album materialized at once.
    pub async fn iter_album(&self, descriptor: AlbumDescriptor, page_size: usize) -> Result<Vec<PhotoAsset>, SyncError> {
        let mut iter = self.album_iterator(descriptor, page_size);
        let mut assets = Vec::new();
        while let Some(asset) = iter.next().await? {
            assets.push(asset);
        }
        Ok(assets)
    }

    /// Builds a lazy, page-buffered album iterator (spec ref: §4.4
    /// `Album.iterate()`). Unlike `iter_album`, this only fetches the next
    /// page when the caller actually asks for the next asset, so a
    /// `--until-found` exit or a cancellation flag can stop the sync driver
    /// without ever requesting pages beyond the ones already consumed.
    pub fn album_iterator(&self, descriptor: AlbumDescriptor, page_size: usize) -> AlbumIterator<'_> {
        AlbumIterator {
            service: self,
            descriptor,
            page_size,
            offset: 0,
            buffer: std::collections::VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Owns the pagination cursor for one album traversal. Each call to `next()`
/// drains a buffered page before issuing `fetch_page` for the next one;
/// mirrors the original's generator (`yield Asset(...)` inside a `while
/// True` loop) without needing an async-generator language feature.
pub struct AlbumIterator<'a> {
    service: &'a PhotoService,
    descriptor: AlbumDescriptor,
    page_size: usize,
    offset: i64,
    buffer: std::collections::VecDeque<PhotoAsset>,
    exhausted: bool,
}

impl<'a> AlbumIterator<'a> {
    pub async fn next(&mut self) -> Result<Option<PhotoAsset>, SyncError> {
        loop {
            if let Some(asset) = self.buffer.pop_front() {
                return Ok(Some(asset));
            }
            if self.exhausted {
                return Ok(None);
            }
            let (pairs, next) = self.service.fetch_page(&self.descriptor, self.offset, self.page_size).await?;
            for (master, asset) in pairs {
                self.buffer.push_back(PhotoAsset::new(master, asset, self.service.match_policy, self.service.raw_policy));
            }
            match next {
                Some(next_offset) => self.offset = next_offset,
                None => self.exhausted = true,
            }
            if self.buffer.is_empty() && self.exhausted {
                return Ok(None);
            }
        }
    }
}

fn urlencoding_value(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    urlencode(&raw)
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

const DESIRED_KEYS: &[&str] = &[
    "resJPEGFullWidth", "resJPEGFullHeight", "resJPEGFullFileType", "resJPEGFullFingerprint", "resJPEGFullRes",
    "resJPEGLargeWidth", "resJPEGLargeHeight", "resJPEGLargeFileType", "resJPEGLargeFingerprint", "resJPEGLargeRes",
    "resJPEGMedWidth", "resJPEGMedHeight", "resJPEGMedFileType", "resJPEGMedFingerprint", "resJPEGMedRes",
    "resJPEGThumbWidth", "resJPEGThumbHeight", "resJPEGThumbFileType", "resJPEGThumbFingerprint", "resJPEGThumbRes",
    "resVidFullWidth", "resVidFullHeight", "resVidFullFileType", "resVidFullFingerprint", "resVidFullRes",
    "resVidMedWidth", "resVidMedHeight", "resVidMedFileType", "resVidMedFingerprint", "resVidMedRes",
    "resVidSmallWidth", "resVidSmallHeight", "resVidSmallFileType", "resVidSmallFingerprint", "resVidSmallRes",
    "resSidecarWidth", "resSidecarHeight", "resSidecarFileType", "resSidecarFingerprint", "resSidecarRes",
    "itemType", "dataClassType", "filenameEnc", "originalOrientation",
    "resOriginalWidth", "resOriginalHeight", "resOriginalFileType", "resOriginalFingerprint", "resOriginalRes",
    "resOriginalAltWidth", "resOriginalAltHeight", "resOriginalAltFileType", "resOriginalAltFingerprint", "resOriginalAltRes",
    "resOriginalVidComplWidth", "resOriginalVidComplHeight", "resOriginalVidComplFileType", "resOriginalVidComplFingerprint", "resOriginalVidComplRes",
    "isDeleted", "isExpunged", "dateExpunged", "remappedRef",
    "recordName", "recordType", "recordChangeTag", "masterRef", "adjustmentRenderType", "assetDate", "addedDate",
    "isFavorite", "isHidden", "orientation", "duration", "assetSubtype", "assetSubtypeV2", "assetHDRType",
    "burstFlags", "burstFlagsExt", "burstId", "captionEnc", "locationEnc", "locationV2Enc",
    "locationLatitude", "locationLongitude", "adjustmentType", "timeZoneOffset",
    "vidComplDurValue", "vidComplDurScale", "vidComplDispValue", "vidComplDispScale",
    "keywordsEnc", "extendedDescEnc", "adjustedMediaMetaDataEnc", "adjustmentSimpleDataEnc",
    "vidComplVisibilityState", "customRenderedValue", "containerId", "itemId", "position", "isKeyAsset",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_folders_cover_all_expected_names() {
        let names: Vec<&str> = smart_folders().iter().map(|f| f.name).collect();
        assert!(names.contains(&"All Photos"));
        assert!(names.contains(&"Recently Deleted"));
        assert!(names.contains(&"Hidden"));
        assert_eq!(names.len(), 11);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("simple"), "simple");
    }
}
