//! Structural diff between two JSON documents.
//!
//! Paths are rendered as `root['key'][index]`. Changes are grouped by kind:
//!
//! | Kind | Recorded value |
//! |------|----------------|
//! | `values_changed` | `{new_value}` |
//! | `type_changes` | `{old_type, new_type, new_value}` |
//! | `dictionary_item_added` / `_removed` | the item |
//! | `iterable_item_added` / `_removed` | the item |
//!
//! Lists are compared position by position; extra tail items are recorded
//! as added or removed. Excluded paths never appear in a delta, and
//! excluded children are pruned from added or removed subtrees (excluded
//! list items are replaced by `null`).

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, Result};

/// Paths that never enter a delta.
pub const EXCLUDE_FROM_DELTAS: &[&str] = &["root['memory_session_id']", "root['saved_memory_session_id']"];

// ============================================================================
// Exclusions
// ============================================================================

/// Decides which paths are left out of deltas.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    paths: Vec<String>,
    patterns: Vec<Regex>,
}

impl ExclusionPolicy {
    pub fn new(paths: Vec<String>, patterns: Vec<Regex>) -> Self {
        Self { paths, patterns }
    }

    /// Nothing excluded.
    pub fn none() -> Self {
        Self::default()
    }

    /// A literal path excludes itself and everything beneath it; patterns
    /// match anywhere in the rendered path.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.paths.iter().any(|p| path == p || (path.starts_with(p.as_str()) && path[p.len()..].starts_with('[')))
            || self.patterns.iter().any(|r| r.is_match(path))
    }
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeltaPath(pub Vec<Segment>);

impl DeltaPath {
    pub fn root() -> Self {
        Self::default()
    }

    fn child(&self, segment: Segment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let bad = || Error::Delta(format!("malformed delta path {text:?}"));
        let mut rest = text.strip_prefix("root").ok_or_else(bad)?;
        let mut segments = Vec::new();
        while !rest.is_empty() {
            rest = rest.strip_prefix('[').ok_or_else(bad)?;
            if let Some(quoted) = rest.strip_prefix('\'') {
                let mut key = String::new();
                let mut chars = quoted.char_indices();
                let end = loop {
                    match chars.next() {
                        Some((_, '\\')) => key.push(chars.next().ok_or_else(bad)?.1),
                        Some((i, '\'')) => break i,
                        Some((_, c)) => key.push(c),
                        None => return Err(bad()),
                    }
                };
                rest = quoted[end + 1..].strip_prefix(']').ok_or_else(bad)?;
                segments.push(Segment::Key(key));
            } else {
                let close = rest.find(']').ok_or_else(bad)?;
                let index = rest[..close].parse().map_err(|_| bad())?;
                rest = &rest[close + 1..];
                segments.push(Segment::Index(index));
            }
        }
        Ok(Self(segments))
    }

    fn split_last(&self) -> Option<(&[Segment], &Segment)> {
        let (last, parent) = self.0.split_last()?;
        Some((parent, last))
    }
}

impl fmt::Display for DeltaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("root")?;
        for segment in &self.0 {
            match segment {
                Segment::Key(k) => write!(f, "['{}']", k.replace('\\', "\\\\").replace('\'', "\\'"))?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Delta
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub new_value: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeChange {
    pub old_type: String,
    pub new_type: String,
    pub new_value: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values_changed: BTreeMap<String, ValueChange>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub type_changes: BTreeMap<String, TypeChange>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dictionary_item_added: BTreeMap<String, Json>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dictionary_item_removed: BTreeMap<String, Json>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub iterable_item_added: BTreeMap<String, Json>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub iterable_item_removed: BTreeMap<String, Json>,
}

/// Type names used in `type_changes`.
fn type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "NoneType",
        Json::Bool(_) => "bool",
        Json::Number(n) if n.is_f64() => "float",
        Json::Number(_) => "int",
        Json::String(_) => "str",
        Json::Array(_) => "list",
        Json::Object(_) => "dict",
    }
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.values_changed.is_empty()
            && self.type_changes.is_empty()
            && self.dictionary_item_added.is_empty()
            && self.dictionary_item_removed.is_empty()
            && self.iterable_item_added.is_empty()
            && self.iterable_item_removed.is_empty()
    }

    /// Every path the delta touches.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.values_changed
            .keys()
            .chain(self.type_changes.keys())
            .chain(self.dictionary_item_added.keys())
            .chain(self.dictionary_item_removed.keys())
            .chain(self.iterable_item_added.keys())
            .chain(self.iterable_item_removed.keys())
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or_else(|_| Json::Object(Map::new()))
    }

    pub fn from_json(json: &Json) -> Result<Self> {
        serde_json::from_value(json.clone()).map_err(|e| Error::Delta(e.to_string()))
    }

    /// Changes turning `prev` into `curr`.
    pub fn compute(prev: &Json, curr: &Json, policy: &ExclusionPolicy) -> Self {
        let mut delta = Delta::default();
        delta.diff(&DeltaPath::root(), prev, curr, policy);
        delta
    }

    fn diff(&mut self, path: &DeltaPath, a: &Json, b: &Json, policy: &ExclusionPolicy) {
        let rendered = path.to_string();
        if policy.is_excluded(&rendered) {
            return;
        }
        match (a, b) {
            (Json::Object(old), Json::Object(new)) => {
                for (key, old_value) in old {
                    let child = path.child(Segment::Key(key.clone()));
                    match new.get(key) {
                        Some(new_value) => self.diff(&child, old_value, new_value, policy),
                        None => {
                            if let Some(item) = prune(&child, old_value, policy) {
                                self.dictionary_item_removed.insert(child.to_string(), item);
                            }
                        }
                    }
                }
                for (key, new_value) in new.iter().filter(|(k, _)| !old.contains_key(*k)) {
                    let child = path.child(Segment::Key(key.clone()));
                    if let Some(item) = prune(&child, new_value, policy) {
                        self.dictionary_item_added.insert(child.to_string(), item);
                    }
                }
            }
            (Json::Array(old), Json::Array(new)) => {
                let common = old.len().min(new.len());
                for i in 0..common {
                    self.diff(&path.child(Segment::Index(i)), &old[i], &new[i], policy);
                }
                for (i, item) in old.iter().enumerate().skip(common) {
                    let child = path.child(Segment::Index(i));
                    if let Some(item) = prune(&child, item, policy) {
                        self.iterable_item_removed.insert(child.to_string(), item);
                    }
                }
                for (i, item) in new.iter().enumerate().skip(common) {
                    let child = path.child(Segment::Index(i));
                    if let Some(item) = prune(&child, item, policy) {
                        self.iterable_item_added.insert(child.to_string(), item);
                    }
                }
            }
            _ if type_name(a) == type_name(b) => {
                if a != b {
                    self.values_changed.insert(rendered, ValueChange { new_value: b.clone() });
                }
            }
            _ => {
                let new_value = prune(path, b, policy).unwrap_or(Json::Null);
                self.type_changes.insert(
                    rendered,
                    TypeChange { old_type: type_name(a).into(), new_type: type_name(b).into(), new_value },
                );
            }
        }
    }

    /// Apply the delta to `doc` in place.
    pub fn apply(&self, doc: &mut Json) -> Result<()> {
        for (path, change) in &self.values_changed {
            *lookup(doc, &DeltaPath::parse(path)?)? = change.new_value.clone();
        }
        for (path, change) in &self.type_changes {
            *lookup(doc, &DeltaPath::parse(path)?)? = change.new_value.clone();
        }

        for path in self.dictionary_item_removed.keys() {
            let parsed = DeltaPath::parse(path)?;
            let (parent, key) = split_key(&parsed, path)?;
            lookup(doc, &parent)?
                .as_object_mut()
                .and_then(|obj| obj.remove(&key))
                .ok_or_else(|| Error::Delta(format!("cannot remove {path}: missing")))?;
        }

        let mut removals = parse_indexed(&self.iterable_item_removed)?;
        removals.sort_by(|a, b| b.cmp(a));
        for (parent, index, path) in removals {
            let list = lookup(doc, &parent)?
                .as_array_mut()
                .ok_or_else(|| Error::Delta(format!("cannot remove {path}: parent is not a list")))?;
            if index >= list.len() {
                return Err(Error::Delta(format!("cannot remove {path}: index out of range")));
            }
            list.remove(index);
        }

        for (path, item) in &self.dictionary_item_added {
            let parsed = DeltaPath::parse(path)?;
            let (parent, key) = split_key(&parsed, path)?;
            lookup(doc, &parent)?
                .as_object_mut()
                .ok_or_else(|| Error::Delta(format!("cannot add {path}: parent is not a dict")))?
                .insert(key, item.clone());
        }

        let mut additions = parse_indexed(&self.iterable_item_added)?;
        additions.sort();
        for (parent, index, path) in additions {
            let list = lookup(doc, &parent)?
                .as_array_mut()
                .ok_or_else(|| Error::Delta(format!("cannot add {path}: parent is not a list")))?;
            if index > list.len() {
                return Err(Error::Delta(format!("cannot add {path}: index out of range")));
            }
            list.insert(index, self.iterable_item_added[&path].clone());
        }
        Ok(())
    }
}

/// `value` with excluded descendants removed, or `None` if `path` itself is excluded.
fn prune(path: &DeltaPath, value: &Json, policy: &ExclusionPolicy) -> Option<Json> {
    if policy.is_excluded(&path.to_string()) {
        return None;
    }
    Some(match value {
        Json::Object(obj) => Json::Object(
            obj.iter()
                .filter_map(|(k, v)| Some((k.clone(), prune(&path.child(Segment::Key(k.clone())), v, policy)?)))
                .collect(),
        ),
        Json::Array(items) => Json::Array(
            items
                .iter()
                .enumerate()
                // excluded items become null so later indices still line up
                .map(|(i, v)| prune(&path.child(Segment::Index(i)), v, policy).unwrap_or(Json::Null))
                .collect(),
        ),
        other => other.clone(),
    })
}

fn lookup<'a>(doc: &'a mut Json, path: &DeltaPath) -> Result<&'a mut Json> {
    let mut current = doc;
    for segment in &path.0 {
        current = match (segment, current) {
            (Segment::Key(k), Json::Object(obj)) => obj.get_mut(k),
            (Segment::Index(i), Json::Array(items)) => items.get_mut(*i),
            _ => None,
        }
        .ok_or_else(|| Error::Delta(format!("path {path} not found")))?;
    }
    Ok(current)
}

fn split_key(path: &DeltaPath, raw: &str) -> Result<(DeltaPath, String)> {
    match path.split_last() {
        Some((parent, Segment::Key(key))) => Ok((DeltaPath(parent.to_vec()), key.clone())),
        _ => Err(Error::Delta(format!("{raw} does not name a dict item"))),
    }
}

fn parse_indexed(items: &BTreeMap<String, Json>) -> Result<Vec<(DeltaPath, usize, String)>> {
    items
        .keys()
        .map(|raw| {
            let path = DeltaPath::parse(raw)?;
            match path.split_last() {
                Some((parent, Segment::Index(i))) => Ok((DeltaPath(parent.to_vec()), *i, raw.clone())),
                _ => Err(Error::Delta(format!("{raw} does not name a list item"))),
            }
        })
        .collect()
}

/// Changes between `prev` and `curr` as a JSON object; `{}` when nothing
/// relevant changed.
pub fn compute_delta(prev: &Json, curr: &Json, policy: &ExclusionPolicy) -> Json {
    Delta::compute(prev, curr, policy).to_json()
}

/// Apply a JSON delta to `data`, returning the new document.
pub fn apply_delta(data: &Json, delta: &Json) -> Result<Json> {
    let delta = Delta::from_json(delta)?;
    let mut out = data.clone();
    delta.apply(&mut out).inspect_err(|e| tracing::error!(error = %e, "applying delta failed"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn default_policy() -> ExclusionPolicy {
        ExclusionPolicy::new(EXCLUDE_FROM_DELTAS.iter().map(|s| s.to_string()).collect(), Vec::new())
    }

    #[test]
    fn test_path_round_trip() {
        let text = r"root['characters'][3]['it\'s']";
        let path = DeltaPath::parse(text).unwrap();
        assert_eq!(
            path.0,
            vec![Segment::Key("characters".into()), Segment::Index(3), Segment::Key("it's".into())]
        );
        assert_eq!(path.to_string(), text);
        assert!(DeltaPath::parse("characters").is_err());
        assert!(DeltaPath::parse("root[x]").is_err());
    }

    #[test]
    fn test_kinds() {
        let prev = json!({"a": 1, "b": "x", "gone": true, "list": [1, 2, 3], "n": null});
        let curr = json!({"a": 2, "b": 5, "new": {"k": 1}, "list": [1, 9], "n": null});
        let delta = Delta::compute(&prev, &curr, &ExclusionPolicy::none());

        assert_eq!(delta.values_changed["root['a']"].new_value, json!(2));
        assert_eq!(delta.values_changed["root['list'][1]"].new_value, json!(9));
        let tc = &delta.type_changes["root['b']"];
        assert_eq!((tc.old_type.as_str(), tc.new_type.as_str()), ("str", "int"));
        assert_eq!(delta.dictionary_item_removed["root['gone']"], json!(true));
        assert_eq!(delta.dictionary_item_added["root['new']"], json!({"k": 1}));
        assert_eq!(delta.iterable_item_removed["root['list'][2]"], json!(3));

        let mut doc = prev.clone();
        delta.apply(&mut doc).unwrap();
        assert_eq!(doc, curr);
    }

    #[test]
    fn test_no_change_is_empty_object() {
        let doc = json!({"a": [1, {"b": 2}]});
        assert_eq!(compute_delta(&doc, &doc, &ExclusionPolicy::none()), json!({}));
    }

    #[test]
    fn test_excluded_paths_never_recorded() {
        let policy = default_policy();
        let prev = json!({"characters": [{"name": "A"}], "memory_session_id": "s1"});
        let curr = json!({"characters": [{"name": "B"}], "memory_session_id": "s2"});
        let delta = Delta::compute(&prev, &curr, &policy);
        assert_eq!(delta.paths().collect::<Vec<_>>(), vec!["root['characters'][0]['name']"]);

        // removal and addition of an excluded key
        let delta = Delta::compute(&json!({"memory_session_id": "x"}), &json!({}), &policy);
        assert!(delta.is_empty());
        let delta = Delta::compute(&json!({}), &json!({"memory_session_id": "x"}), &policy);
        assert!(delta.is_empty());
    }

    #[test]
    fn test_regex_exclusion_prunes_added_subtrees() {
        let policy = ExclusionPolicy::new(Vec::new(), vec![Regex::new(r"\['volatile'\]$").unwrap()]);
        let prev = json!({"items": []});
        let curr = json!({"items": [{"name": "x", "volatile": 1}]});
        let delta = Delta::compute(&prev, &curr, &policy);
        assert_eq!(delta.iterable_item_added["root['items'][0]"], json!({"name": "x"}));
        assert!(!delta.to_json().to_string().contains("volatile"));
    }

    #[test]
    fn test_excluded_list_items_blanked_in_added_subtrees() {
        let policy = ExclusionPolicy::new(Vec::new(), vec![Regex::new(r"\['secrets'\]\[\d+\]").unwrap()]);
        let curr = json!({"bag": {"secrets": [{"token": "LEAK"}], "kept": [1]}});
        let delta = Delta::compute(&json!({}), &curr, &policy);
        assert_eq!(delta.dictionary_item_added["root['bag']"], json!({"secrets": [null], "kept": [1]}));
        assert!(!delta.to_json().to_string().contains("LEAK"));

        // the same subtree arriving through a type change
        let delta = Delta::compute(&json!({"bag": 1}), &curr, &policy);
        assert!(!delta.to_json().to_string().contains("LEAK"));
    }

    #[test]
    fn test_apply_to_wrong_document_fails() {
        let delta = Delta::compute(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}), &ExclusionPolicy::none());
        let err = delta.apply(&mut json!({"x": 1})).unwrap_err();
        assert!(matches!(err, Error::Delta(_)));
    }

    fn arb_json() -> impl Strategy<Value = Json> {
        let leaf = prop_oneof![
            Just(Json::Null),
            any::<bool>().prop_map(Json::from),
            (-50i64..50).prop_map(Json::from),
            "[a-c]{0,3}".prop_map(Json::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Json::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Json::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_apply_reproduces_target(prev in arb_json(), curr in arb_json()) {
            let delta = Delta::compute(&prev, &curr, &ExclusionPolicy::none());
            let mut doc = prev.clone();
            delta.apply(&mut doc).unwrap();
            prop_assert_eq!(doc, curr);
        }

        #[test]
        fn prop_delta_survives_json(prev in arb_json(), curr in arb_json()) {
            let json = compute_delta(&prev, &curr, &ExclusionPolicy::none());
            prop_assert_eq!(apply_delta(&prev, &json).unwrap(), curr);
        }
    }
}
