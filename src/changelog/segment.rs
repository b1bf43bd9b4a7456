//! Segment files and atomic writes.
//!
//! A segment holds a contiguous run of revisions:
//!
//! ```json
//! {"version":1,"base":"scene.json.base.json","start_rev":1,
//!  "deltas":[{"rev":1,"ts":1700000000,"delta":{...},"meta":{...}}],"latest_rev":1}
//! ```
//!
//! Segments are written compact; snapshots are pretty-printed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, error};

use super::delta::Delta;
use crate::scene::SceneRef;
use crate::Result;

pub const SEGMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub rev: u64,
    /// UTC unix seconds.
    pub ts: i64,
    pub delta: Delta,
    #[serde(default = "empty_meta")]
    pub meta: Json,
}

fn empty_meta() -> Json {
    Json::Object(Map::new())
}

impl Entry {
    pub fn new(rev: u64, delta: Delta, meta: Json) -> Self {
        let meta = if meta.is_null() { empty_meta() } else { meta };
        Self { rev, ts: chrono::Utc::now().timestamp(), delta, meta }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub version: u32,
    pub base: String,
    pub start_rev: u64,
    #[serde(default)]
    pub deltas: Vec<Entry>,
    #[serde(default)]
    pub latest_rev: u64,
}

impl Segment {
    pub fn new(base: String, start_rev: u64) -> Self {
        Self { version: SEGMENT_VERSION, base, start_rev, deltas: Vec::new(), latest_rev: 0 }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut segment: Segment = serde_json::from_slice(&fs::read(path)?)?;
        let max_rev = segment.deltas.iter().map(|e| e.rev).max().unwrap_or(0);
        segment.latest_rev = segment.latest_rev.max(max_rev);
        Ok(segment)
    }

    pub fn push(&mut self, entry: Entry) {
        self.latest_rev = self.latest_rev.max(entry.rev);
        self.deltas.push(entry);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Paths
// ============================================================================

pub fn base_filename(scene: &dyn SceneRef) -> String {
    format!("{}.base.json", scene.filename())
}

pub fn base_path(scene: &dyn SceneRef) -> PathBuf {
    scene.changelog_dir().join(base_filename(scene))
}

pub fn latest_path(scene: &dyn SceneRef) -> PathBuf {
    scene.changelog_dir().join(format!("{}.latest.json", scene.filename()))
}

pub fn segment_path(scene: &dyn SceneRef, start_rev: u64) -> PathBuf {
    scene.changelog_dir().join(format!("{}.changelog.{start_rev}.json", scene.filename()))
}

/// Segment files of `scene`, ordered by `start_rev`.
pub fn segment_files(scene: &dyn SceneRef) -> Result<Vec<(u64, PathBuf)>> {
    let dir = scene.changelog_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}.changelog.", scene.filename());
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let start = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(start) = start {
            files.push((start, path));
        }
    }
    files.sort();
    Ok(files)
}

/// Every segment, ordered by `start_rev`.
pub fn load_segments(scene: &dyn SceneRef) -> Result<Vec<Segment>> {
    segment_files(scene)?.into_iter().map(|(_, path)| Segment::load(&path)).collect()
}

/// Highest revision across `segments`, 0 when there is none.
pub fn latest_rev(segments: &[Segment]) -> u64 {
    segments.iter().map(|s| s.latest_rev).max().unwrap_or(0)
}

pub(crate) fn read_json(path: &Path) -> Result<Json> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

pub(crate) fn pretty(json: &Json) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(json)?)
}

// ============================================================================
// Staged writes
// ============================================================================

/// Files written next to their destination and renamed into place together.
///
/// Dropping a batch that was never published removes its temporary files.
#[derive(Debug, Default)]
pub(crate) struct StagedWrite {
    files: Vec<(PathBuf, PathBuf)>,
}

impl StagedWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, path: PathBuf, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        self.files.push((tmp, path));
        Ok(())
    }

    pub fn publish(mut self) -> Result<()> {
        for (tmp, path) in std::mem::take(&mut self.files) {
            fs::rename(&tmp, &path).inspect_err(|e| {
                error!(path = %path.display(), error = %e, "replacing changelog file failed");
            })?;
            debug!(path = %path.display(), "changelog file written");
        }
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        for (tmp, _) in self.files.drain(..) {
            let _ = fs::remove_file(tmp);
        }
    }
}

fn digits(n: u64) -> u64 {
    n.checked_ilog10().map_or(1, |d| d as u64 + 1)
}

/// Stage `entries` onto the newest segment, starting a new segment whenever
/// the next entry would push the current one past `max_bytes`.
pub(crate) fn stage_entries(
    scene: &dyn SceneRef,
    entries: Vec<Entry>,
    max_bytes: u64,
    staged: &mut StagedWrite,
) -> Result<()> {
    let Some(first_rev) = entries.first().map(|e| e.rev) else {
        return Ok(());
    };
    let mut current = match segment_files(scene)?.pop() {
        Some((_, path)) => Segment::load(&path)?,
        None => Segment::new(base_filename(scene), first_rev),
    };
    let mut current_len = current.to_bytes()?.len() as u64;
    // serialized size once `entry` is pushed: the entry, its comma and the wider latest_rev
    let grown = |segment: &Segment, len: u64, entry_len: u64, rev: u64| {
        (len + entry_len + digits(rev)).saturating_sub(digits(segment.latest_rev))
    };

    for entry in entries {
        let entry_len = serde_json::to_vec(&entry)?.len() as u64 + 1;
        let mut next_len = grown(&current, current_len, entry_len, entry.rev);
        if !current.deltas.is_empty() && next_len > max_bytes {
            staged.stage(segment_path(scene, current.start_rev), &current.to_bytes()?)?;
            current = Segment::new(base_filename(scene), entry.rev);
            current_len = current.to_bytes()?.len() as u64;
            next_len = grown(&current, current_len, entry_len, entry.rev);
        }
        current_len = next_len;
        current.push(entry);
    }
    staged.stage(segment_path(scene, current.start_rev), &current.to_bytes()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_segment_wire_shape() {
        let mut segment = Segment::new("s.json.base.json".into(), 1);
        segment.push(Entry { rev: 1, ts: 10, delta: Delta::default(), meta: json!({"a": 1}) });
        let json: Json = serde_json::from_slice(&segment.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "version": 1,
                "base": "s.json.base.json",
                "start_rev": 1,
                "deltas": [{"rev": 1, "ts": 10, "delta": {}, "meta": {"a": 1}}],
                "latest_rev": 1,
            })
        );
    }

    #[test]
    fn test_latest_rev_repaired_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.json");
        fs::write(
            &path,
            r#"{"version":1,"base":"b","start_rev":1,"deltas":[{"rev":1,"ts":0,"delta":{}},{"rev":2,"ts":0,"delta":{}}],"latest_rev":0}"#,
        )
        .unwrap();
        let segment = Segment::load(&path).unwrap();
        assert_eq!(segment.latest_rev, 2);
        assert_eq!(segment.deltas[0].meta, json!({}));
    }

    #[test]
    fn test_unpublished_stage_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.json");
        {
            let mut staged = StagedWrite::new();
            staged.stage(target.clone(), b"{}").unwrap();
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path().join("nested")).unwrap().count(), 0);

        let mut staged = StagedWrite::new();
        staged.stage(target.clone(), b"{}").unwrap();
        staged.publish().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}");
    }
}
