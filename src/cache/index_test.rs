//! Tests for tag and segment indexes.

use super::index::{SegmentIndex, TagIndex};

fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}

fn index(keys: &[&str]) -> SegmentIndex {
    let mut idx = SegmentIndex::default();
    for k in keys {
        idx.insert(k);
    }
    idx
}

const KEYS: &[&str] = &[
    "user:1:profile",
    "user:2:profile",
    "user:2:stats",
    "users:count",
    "stream:9:stats",
    "plain",
    "plainer",
];

/// Reference answer: a full scan.
fn scan(pred: impl Fn(&str) -> bool) -> Vec<String> {
    sorted(KEYS.iter().filter(|k| pred(k)).map(|k| k.to_string()).collect())
}

#[test]
fn test_prefix_lookup_equals_full_scan() {
    let idx = index(KEYS);
    for prefix in ["user:", "user", "user:2", "user:2:", "us", "plain", "", "stream:9:stats", "nope", ":"] {
        assert_eq!(
            sorted(idx.with_prefix(prefix)),
            scan(|k| k.starts_with(prefix)),
            "prefix {prefix:?}"
        );
    }
}

#[test]
fn test_suffix_lookup_equals_full_scan() {
    let idx = index(KEYS);
    for suffix in [":stats", "stats", "profile", ":profile", "2:stats", "count", "er", "", "nope", ":"] {
        assert_eq!(
            sorted(idx.with_suffix(suffix)),
            scan(|k| k.ends_with(suffix)),
            "suffix {suffix:?}"
        );
    }
}

#[test]
fn test_removed_keys_leave_no_bucket() {
    let mut idx = index(&["a:x", "a:y"]);
    idx.remove("a:x");
    assert_eq!(idx.with_prefix("a:"), vec!["a:y".to_string()]);
    idx.remove("a:y");
    assert!(idx.with_prefix("").is_empty());
    assert!(idx.with_suffix("").is_empty());
}

#[test]
fn test_tag_index_drops_empty_tags() {
    let mut tags = TagIndex::default();
    tags.add("streamer:7", "k1");
    tags.add("streamer:7", "k2");
    tags.add("global", "k1");
    assert_eq!(tags.members("streamer:7"), 2);
    assert_eq!(tags.len(), 2);

    tags.remove_key("k1", &["streamer:7".to_string(), "global".to_string()]);
    assert_eq!(tags.members("streamer:7"), 1);
    assert_eq!(tags.members("global"), 0);
    assert_eq!(tags.len(), 1, "tag without members must be dropped");

    let taken = tags.take("streamer:7");
    assert!(taken.contains("k2"));
    assert_eq!(tags.len(), 0);
    assert!(tags.take("streamer:7").is_empty());
}
