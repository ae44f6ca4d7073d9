//! Secondary indexes: tag membership and first/last key segment buckets.

use std::collections::{HashMap, HashSet};

const SEPARATOR: char = ':';

/// Reverse mapping tag -> keys. Empty tags are dropped.
#[derive(Debug, Default)]
pub struct TagIndex {
    tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn add(&mut self, tag: &str, key: &str) {
        self.tags
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Drops `key` from each of the given tags.
    pub fn remove_key(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(members) = self.tags.get_mut(tag) {
                members.remove(key);
                if members.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    /// Removes the tag and hands back its members.
    pub fn take(&mut self, tag: &str) -> HashSet<String> {
        self.tags.remove(tag).unwrap_or_default()
    }

    pub fn members(&self, tag: &str) -> usize {
        self.tags.get(tag).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

/// Keys bucketed by their first and last `:`-separated segment.
///
/// A key without a separator is its own first and last segment.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    prefixes: HashMap<String, HashSet<String>>,
    suffixes: HashMap<String, HashSet<String>>,
}

impl SegmentIndex {
    pub fn insert(&mut self, key: &str) {
        self.prefixes
            .entry(first_segment(key).to_string())
            .or_default()
            .insert(key.to_string());
        self.suffixes
            .entry(last_segment(key).to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        drop_member(&mut self.prefixes, first_segment(key), key);
        drop_member(&mut self.suffixes, last_segment(key), key);
    }

    /// Every indexed key starting with `prefix`.
    ///
    /// With a separator in `prefix`, all matches share its first segment, so one
    /// bucket is read. Otherwise matches sit in buckets whose segment starts with
    /// `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        let matches = |k: &&String| k.starts_with(prefix);
        match prefix.find(SEPARATOR) {
            Some(at) => self
                .prefixes
                .get(&prefix[..at])
                .map(|keys| keys.iter().filter(matches).cloned().collect())
                .unwrap_or_default(),
            None => self
                .prefixes
                .iter()
                .filter(|(segment, _)| segment.starts_with(prefix))
                .flat_map(|(_, keys)| keys.iter().filter(matches).cloned())
                .collect(),
        }
    }

    /// Every indexed key ending with `suffix`. Mirror image of [`Self::with_prefix`].
    pub fn with_suffix(&self, suffix: &str) -> Vec<String> {
        let matches = |k: &&String| k.ends_with(suffix);
        match suffix.rfind(SEPARATOR) {
            Some(at) => self
                .suffixes
                .get(&suffix[at + SEPARATOR.len_utf8()..])
                .map(|keys| keys.iter().filter(matches).cloned().collect())
                .unwrap_or_default(),
            None => self
                .suffixes
                .iter()
                .filter(|(segment, _)| segment.ends_with(suffix))
                .flat_map(|(_, keys)| keys.iter().filter(matches).cloned())
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.prefixes.clear();
        self.suffixes.clear();
    }
}

fn first_segment(key: &str) -> &str {
    key.split(SEPARATOR).next().unwrap_or(key)
}

fn last_segment(key: &str) -> &str {
    key.rsplit(SEPARATOR).next().unwrap_or(key)
}

fn drop_member(buckets: &mut HashMap<String, HashSet<String>>, segment: &str, key: &str) {
    if let Some(keys) = buckets.get_mut(segment) {
        keys.remove(key);
        if keys.is_empty() {
            buckets.remove(segment);
        }
    }
}
