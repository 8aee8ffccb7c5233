//! Data model shared by both sides of a sync cycle.
//!
//! `Item` and `Tombstone` serialize directly into the remote document, so the
//! serde attributes here define the wire format.

use crate::identity::ItemKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Current remote document format version.
pub const DOCUMENT_VERSION: u32 = 3;

/// One bookmark or folder as seen by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(rename = "id")]
    pub key: ItemKey,
    pub title: String,
    /// Absent for containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub date_added: u64,
    #[serde(default)]
    pub date_modified: u64,
    /// Absent means top-level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Item {
    /// Build an item, deriving its key from its content.
    pub fn new(
        title: impl Into<String>,
        url: Option<String>,
        parent_title: Option<String>,
        date_added: u64,
        date_modified: u64,
    ) -> Self {
        let title = title.into();
        let key = ItemKey::derive(url.as_deref(), &title, parent_title.as_deref());
        Self {
            key,
            title,
            url,
            date_added,
            date_modified,
            parent_title,
            deleted: false,
        }
    }

    pub fn is_container(&self) -> bool {
        self.url.is_none()
    }
}

/// Key to item view of one side at cycle start.
pub type ItemMap = HashMap<ItemKey, Item>;

/// A local deletion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
    pub deleted_at: u64,
}

impl Tombstone {
    pub fn for_item(item: &Item, deleted_at: u64) -> Self {
        Self {
            title: item.title.clone(),
            url: item.url.clone(),
            parent_title: item.parent_title.clone(),
            deleted_at,
        }
    }
}

/// Key to tombstone map, as persisted locally and published remotely.
pub type TombstoneMap = BTreeMap<ItemKey, Tombstone>;

/// Last successful sync of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClock {
    pub name: String,
    pub last_sync: u64,
}

/// The shared document, replaced wholesale by every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub last_sync: u64,
    #[serde(default)]
    pub last_sync_by: Option<String>,
    /// Replica id (as written by that replica) to device clock.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceClock>,
    #[serde(default, rename = "bookmarks")]
    pub items: Vec<Item>,
    #[serde(default, rename = "deletedBookmarks")]
    pub tombstones: TombstoneMap,
}

impl RemoteDocument {
    /// The document assumed when none exists yet (version 0).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Last sync recorded for a replica in this document.
    pub fn device_last_sync(&self, replica: &str) -> Option<u64> {
        self.devices.get(replica).map(|d| d.last_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_wire_names() {
        let mut item = Item::new(
            "X",
            Some("http://x.test".into()),
            Some("Bookmarks Bar".into()),
            10,
            20,
        );
        item.deleted = true;
        let value = serde_json::to_value(&item).unwrap();

        assert_eq!(value["id"], item.key.as_str());
        assert_eq!(value["dateAdded"], 10);
        assert_eq!(value["dateModified"], 20);
        assert_eq!(value["parentTitle"], "Bookmarks Bar");
        assert_eq!(value["deleted"], true);
    }

    #[test]
    fn test_container_omits_url() {
        let folder = Item::new("Research", None, None, 1, 1);
        let value = serde_json::to_value(&folder).unwrap();
        assert!(value.get("url").is_none());
        assert!(value.get("parentTitle").is_none());
        assert!(folder.is_container());
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "version": 3,
            "lastSync": 1000,
            "lastSyncBy": "00000000000000aa",
            "devices": { "00000000000000aa": { "name": "laptop", "lastSync": 1000 } },
            "bookmarks": [
                { "id": "bm_1", "title": "X", "url": "http://x.test",
                  "dateAdded": 1, "dateModified": 2, "deleted": false }
            ],
            "deletedBookmarks": { "bm_2": { "title": "Y", "url": "http://y.test", "deletedAt": 5 } }
        }"#;
        let doc = RemoteDocument::parse(json).unwrap();

        assert_eq!(doc.version, 3);
        assert_eq!(doc.device_last_sync("00000000000000aa"), Some(1000));
        assert_eq!(doc.items.len(), 1);
        assert_eq!(doc.items[0].parent_title, None);
        assert_eq!(doc.tombstones[&ItemKey::from("bm_2")].deleted_at, 5);
    }

    #[test]
    fn test_parse_sparse_document_defaults() {
        // Documents written by the older format only carry a subset of fields
        let doc = RemoteDocument::parse(r#"{ "version": 2, "lastSync": 7 }"#).unwrap();
        assert_eq!(doc.version, 2);
        assert!(doc.items.is_empty());
        assert!(doc.devices.is_empty());
        assert!(doc.tombstones.is_empty());
    }

    #[test]
    fn test_parse_malformed_fails() {
        assert!(RemoteDocument::parse("not json").is_err());
        assert!(RemoteDocument::parse(r#"{ "bookmarks": 5 }"#).is_err());
    }

    #[test]
    fn test_empty_document_is_version_zero() {
        assert_eq!(RemoteDocument::empty().version, 0);
    }
}
