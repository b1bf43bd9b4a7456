//! # Scene changelog
//!
//! Every committed mutation of a scene document is stored as a delta
//! against the previous revision. Revision 0 is the base snapshot; revision
//! N is the base with deltas 1..=N applied.
//!
//! | File | Content |
//! |------|---------|
//! | `<scene>.base.json` | revision 0, pretty JSON, never rewritten |
//! | `<scene>.latest.json` | most recent committed document, pretty JSON |
//! | `<scene>.changelog.<start_rev>.json` | a segment of delta entries, compact JSON |
//!
//! Appends are all-or-nothing: the segment and the latest snapshot are
//! staged next to their destinations and renamed into place together, so a
//! failed write never consumes a revision.

pub mod delta;
pub mod segment;
pub mod session;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use crate::config::ChangelogConfig;
use crate::scene::SceneRef;
use crate::{Error, Result};

use delta::Delta;
use segment::{base_path, latest_path, load_segments, pretty, read_json, segment_path, Entry, StagedWrite};

// ============================================================================
// Initialisation
// ============================================================================

/// Create the base snapshot, the latest snapshot and an empty first segment.
///
/// Does nothing once a base snapshot exists.
pub fn save_changelog(scene: &dyn SceneRef) -> Result<()> {
    write_initial_files(scene, &scene.serialize())
}

pub(crate) fn write_initial_files(scene: &dyn SceneRef, data: &Json) -> Result<()> {
    let base = base_path(scene);
    if base.exists() {
        return Ok(());
    }
    let bytes = pretty(data)?;
    let mut staged = StagedWrite::new();
    staged.stage(base.clone(), &bytes)?;
    staged.stage(latest_path(scene), &bytes)?;
    if segment::segment_files(scene)?.is_empty() {
        let empty = segment::Segment::new(segment::base_filename(scene), 1);
        staged.stage(segment_path(scene, 1), &empty.to_bytes()?)?;
    }
    staged.publish()?;
    debug!(path = %base.display(), "changelog base created");
    Ok(())
}

/// The latest committed document: the latest snapshot, or a replay when the
/// snapshot is missing or unreadable.
fn load_latest(scene: &dyn SceneRef, latest_rev: u64) -> Result<Json> {
    let path = latest_path(scene);
    if path.exists() {
        match read_json(&path) {
            Ok(json) => return Ok(json),
            Err(e) => warn!(path = %path.display(), error = %e, "latest snapshot unreadable, replaying"),
        }
    }
    replay(scene, latest_rev)
}

// ============================================================================
// Append
// ============================================================================

/// Record the difference between the last committed revision and the
/// scene's current state.
///
/// Returns the new revision, or `None` when nothing relevant changed (in
/// which case no file is touched).
pub fn append_scene_delta(scene: &dyn SceneRef, meta: Json, config: &ChangelogConfig) -> Result<Option<u64>> {
    if !base_path(scene).exists() {
        save_changelog(scene)?;
    }
    let policy = config.policy()?;
    let latest_rev = segment::latest_rev(&load_segments(scene)?);
    let prev = load_latest(scene, latest_rev)?;
    let curr = scene.serialize();

    let delta = Delta::compute(&prev, &curr, &policy);
    if delta.is_empty() {
        debug!(rev = latest_rev, "no change to record");
        return Ok(None);
    }

    let new_rev = latest_rev + 1;
    commit_entries(scene, vec![Entry::new(new_rev, delta, meta)], &curr, config.max_segment_bytes)?;
    scene.set_rev(new_rev);
    info!(scene = %scene.filename(), rev = new_rev, "scene delta appended");
    Ok(Some(new_rev))
}

/// Write `entries` and the new latest snapshot as one unit.
pub(crate) fn commit_entries(scene: &dyn SceneRef, entries: Vec<Entry>, latest: &Json, max_bytes: u64) -> Result<()> {
    let mut staged = StagedWrite::new();
    segment::stage_entries(scene, entries, max_bytes, &mut staged)
        .and_then(|_| staged.stage(latest_path(scene), &pretty(latest)?))
        .inspect_err(|e| error!(scene = %scene.filename(), error = %e, "staging changelog write failed"))?;
    staged.publish()
}

// ============================================================================
// Reconstruction
// ============================================================================

/// The scene document at `to_rev` (latest when `None`).
///
/// A revision past the latest recorded one is rejected.
pub fn reconstruct_scene_data(scene: &dyn SceneRef, to_rev: Option<u64>) -> Result<Json> {
    let latest = segment::latest_rev(&load_segments(scene)?);
    let to_rev = match to_rev {
        Some(rev) if rev > latest => {
            return Err(Error::InvalidRevision { requested: i64::try_from(rev).unwrap_or(i64::MAX), latest });
        }
        Some(rev) => rev,
        None => latest,
    };
    let mut data = replay(scene, to_rev)?;
    reconstruct_cleanup(&mut data);
    Ok(data)
}

fn replay(scene: &dyn SceneRef, to_rev: u64) -> Result<Json> {
    let mut data = read_json(&base_path(scene))?;
    if to_rev == 0 {
        return Ok(data);
    }
    let mut entries: Vec<Entry> =
        load_segments(scene)?.into_iter().flat_map(|s| s.deltas).filter(|e| e.rev <= to_rev).collect();
    entries.sort_by_key(|e| e.rev);
    for entry in entries.iter().filter(|e| !e.delta.is_empty()) {
        entry.delta.apply(&mut data).inspect_err(|e| {
            error!(scene = %scene.filename(), rev = entry.rev, error = %e, "reconstruction aborted");
        })?;
    }
    Ok(data)
}

/// Clear fields that cannot be brought back with an older revision.
///
/// A shared-context reference points at a document outside the scene, so a
/// reconstructed scene is detached from it.
pub fn reconstruct_cleanup(data: &mut Json) {
    if let Some(ctx) = data.get_mut("shared_context")
        && !ctx.is_null()
    {
        *ctx = Json::String(String::new());
    }
}

/// Write the document at `to_rev` next to the scene file, as
/// `<stem>-rev-<N>.json` unless a name is given.
pub fn write_reconstructed_scene(scene: &dyn SceneRef, to_rev: u64, output_filename: Option<&str>) -> Result<PathBuf> {
    let data = reconstruct_scene_data(scene, Some(to_rev))?;
    let name = output_filename.map(str::to_string).unwrap_or_else(|| format!("{}-rev-{to_rev}.json", scene.stem()));
    let path = scene.save_dir().join(name);
    let mut staged = StagedWrite::new();
    staged.stage(path.clone(), &pretty(&data)?)?;
    staged.publish()?;
    debug!(path = %path.display(), rev = to_rev, "reconstructed scene written");
    Ok(path)
}

// ============================================================================
// Rollback
// ============================================================================

/// Replace the scene file with its reconstruction at `to_rev`.
///
/// The new document is staged beside the scene file and renamed over it.
///
/// Revisions outside `0..=latest` are rejected before any file is touched.
/// With `create_backup` the current scene file is first copied to
/// `<backups>/<stem>_pre_rollback_<YYYYMMDDTHHMMSSZ>.json`.
pub fn rollback_scene_to_revision(scene: &dyn SceneRef, to_rev: i64, create_backup: bool) -> Result<PathBuf> {
    let latest = list_revisions(scene)?.into_iter().max().unwrap_or(0);
    let rev = u64::try_from(to_rev)
        .ok()
        .filter(|r| *r <= latest)
        .ok_or(Error::InvalidRevision { requested: to_rev, latest })?;

    let data = reconstruct_scene_data(scene, Some(rev))?;
    let current = scene.scene_path();

    let mut backup = None;
    if create_backup && current.exists() {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let path = scene.backups_dir().join(format!("{}_pre_rollback_{ts}.json", scene.stem()));
        match copy_backup(&current, &path) {
            Ok(()) => backup = Some(path),
            Err(e) => error!(path = %current.display(), error = %e, "rollback backup failed"),
        }
    }

    let mut staged = StagedWrite::new();
    staged.stage(current.clone(), &pretty(&data)?)?;
    staged.publish()?;
    info!(
        path = %current.display(),
        rev,
        backup = ?backup.as_ref().map(|p| p.display().to_string()),
        "rollback applied"
    );
    Ok(current)
}

fn copy_backup(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).map(|_| ())
}

// ============================================================================
// Revision discovery
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevisionEntry {
    pub rev: u64,
    pub ts: i64,
    pub meta: Json,
}

/// Every recorded revision, newest first.
pub fn list_revisions(scene: &dyn SceneRef) -> Result<Vec<u64>> {
    Ok(list_revision_entries(scene)?.into_iter().map(|e| e.rev).collect())
}

/// Every recorded revision with its timestamp and metadata, newest first.
pub fn list_revision_entries(scene: &dyn SceneRef) -> Result<Vec<RevisionEntry>> {
    let mut entries: Vec<RevisionEntry> = load_segments(scene)?
        .into_iter()
        .flat_map(|s| s.deltas)
        .map(|e| RevisionEntry { rev: e.rev, ts: e.ts, meta: e.meta })
        .collect();
    entries.sort_by(|a, b| b.rev.cmp(&a.rev));
    Ok(entries)
}

/// Greatest revision recorded at or before `ts` (unix seconds).
pub fn latest_revision_at(scene: &dyn SceneRef, ts: i64) -> Result<Option<u64>> {
    Ok(list_revision_entries(scene)?.into_iter().filter(|e| e.ts <= ts).map(|e| e.rev).max())
}

// ============================================================================
// Deletion
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub removed_dir: bool,
}

/// Remove the base, latest and every segment file of `scene`, then the
/// changelog directory if it is left empty. Failures are logged and
/// reported, never raised.
pub fn delete_changelog_files(scene: &dyn SceneRef) -> DeleteReport {
    let mut report = DeleteReport::default();
    let mut targets = vec![base_path(scene), latest_path(scene)];
    match segment::segment_files(scene) {
        Ok(files) => targets.extend(files.into_iter().map(|(_, p)| p)),
        Err(e) => warn!(scene = %scene.filename(), error = %e, "listing segments failed"),
    }

    for path in targets.into_iter().filter(|p| p.exists()) {
        match fs::remove_file(&path) {
            Ok(()) => report.deleted.push(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "deleting changelog file failed");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    let dir = scene.changelog_dir();
    let empty = fs::read_dir(&dir).map(|mut d| d.next().is_none()).unwrap_or(false);
    if empty {
        match fs::remove_dir(&dir) {
            Ok(()) => report.removed_dir = true,
            Err(e) => warn!(path = %dir.display(), error = %e, "removing changelog dir failed"),
        }
    }
    info!(scene = %scene.filename(), deleted = report.deleted.len(), failed = report.failed.len(), "changelog deleted");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_cleanup_detaches_shared_context() {
        let mut data = json!({"shared_context": "world.json", "name": "x"});
        reconstruct_cleanup(&mut data);
        assert_eq!(data, json!({"shared_context": "", "name": "x"}));

        let mut data = json!({"name": "x"});
        reconstruct_cleanup(&mut data);
        assert_eq!(data, json!({"name": "x"}));
    }
}
