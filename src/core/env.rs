// src/core/env.rs

//! Helpers for `KEY=VALUE` environment lists as they appear in config files.

use std::collections::{HashMap, HashSet};

/// Returns the key of a `KEY=VALUE` entry. An entry without `=` is all key.
pub fn entry_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

/// Appends the `inherited` entries to `own`, dropping any whose key `own` already sets.
/// The child's own value always survives.
pub fn merge_inherited(own: &[String], inherited: &[String]) -> Vec<String> {
    let present: HashSet<&str> = own.iter().map(|e| entry_key(e)).collect();
    let mut merged = own.to_vec();
    merged.extend(
        inherited
            .iter()
            .filter(|e| !present.contains(entry_key(e)))
            .cloned(),
    );
    merged
}

/// Folds layers of entries into a map; later layers win on key collisions, as do later
/// entries within a layer.
pub fn layered_map<'a, I>(layers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut map = HashMap::new();
    for layer in layers {
        for entry in layer {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Looks a key up in an entry list, honouring last-entry-wins.
pub fn lookup<'a>(entries: &'a [String], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .rev()
        .find(|e| entry_key(e) == key)
        .map(|e| e.split_once('=').map_or("", |(_, v)| v))
}
