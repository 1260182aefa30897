//! Reading listing payloads: item identifiers and pagination metadata

use serde_json::Value;
use std::collections::BTreeSet;

/// Keys probed, in order, for an item's identifier inside a listing
pub const LISTING_ID_KEYS: [&str; 4] = ["id", "match_number", "matchId", "external_id"];

/// Integer from a JSON number or numeric string
pub fn as_identifier(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Items of a listing: the `data` array, or the document itself when it is an array
pub fn listing_items(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("data").and_then(Value::as_array),
        _ => None,
    }
}

/// Collect item identifiers from listing payloads, sorted and deduplicated
pub fn extract_ids<'a, I>(payloads: I, keys: &[&str]) -> Vec<i64>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut ids = BTreeSet::new();
    for payload in payloads {
        for item in listing_items(payload).into_iter().flatten() {
            if let Some(id) = keys.iter().find_map(|k| item.get(*k).and_then(as_identifier)) {
                ids.insert(id);
            }
        }
    }
    ids.into_iter().collect()
}

/// Pagination metadata found on a listing page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageMeta {
    /// Total page count when the listing reports one
    pub last_page: Option<u32>,
    /// `links.next` is present and null
    pub next_is_null: bool,
    /// The page carries a `data` array with no items
    pub empty: bool,
}

impl PageMeta {
    pub fn read(payload: &Value) -> Self {
        let last_page = [
            payload.pointer("/meta/last_page"),
            payload.get("last_page"),
            payload.pointer("/meta/total_pages"),
        ]
        .into_iter()
        .flatten()
        .find_map(as_identifier)
        .and_then(|n| u32::try_from(n).ok());

        let next_is_null = matches!(payload.pointer("/links/next"), Some(Value::Null));
        let empty = listing_items(payload).is_some_and(|items| items.is_empty());

        Self {
            last_page,
            next_is_null,
            empty,
        }
    }

    /// Whether any pagination metadata was found
    pub fn is_known(&self) -> bool {
        self.last_page.is_some() || self.next_is_null
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_ids_sorted_and_deduplicated() {
        let page1 = json!({"data": [{"id": 30}, {"id": "12"}, {"name": "no id"}]});
        let page2 = json!({"data": [{"match_number": 5}, {"id": 30}]});
        let ids = extract_ids([&page1, &page2], &LISTING_ID_KEYS);
        assert_eq!(ids, vec![5, 12, 30]);
    }

    #[test]
    fn test_extract_ids_from_top_level_array() {
        let listing = json!([{"matchId": 9}, {"external_id": "4"}]);
        assert_eq!(extract_ids([&listing], &LISTING_ID_KEYS), vec![4, 9]);
    }

    #[test]
    fn test_extract_ids_ignores_non_listing() {
        let doc = json!({"id": 1, "name": "single"});
        assert!(extract_ids([&doc], &LISTING_ID_KEYS).is_empty());
    }

    #[test]
    fn test_page_meta_last_page() {
        let page = json!({"data": [{"id": 1}], "meta": {"current_page": 1, "last_page": 7}});
        let meta = PageMeta::read(&page);
        assert_eq!(meta.last_page, Some(7));
        assert!(!meta.next_is_null);
        assert!(!meta.empty);
        assert!(meta.is_known());
    }

    #[test]
    fn test_page_meta_next_null_and_empty() {
        let page = json!({"data": [], "links": {"next": null}});
        let meta = PageMeta::read(&page);
        assert_eq!(meta.last_page, None);
        assert!(meta.next_is_null);
        assert!(meta.empty);
    }

    #[test]
    fn test_page_meta_unknown() {
        let page = json!({"data": [{"id": 1}], "links": {"next": "https://example.com/?page=2"}});
        assert!(!PageMeta::read(&page).is_known());
        assert!(!PageMeta::read(&json!("plain")).is_known());
    }
}
