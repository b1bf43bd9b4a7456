//! In-memory changelog session.
//!
//! During an interactive turn deltas are collected in memory and written
//! in one go by [`InMemoryChangelog::commit`]. A commit either lands every
//! pending entry or none of them; on failure the pending list is kept and
//! the caller decides whether to retry or reload the last committed
//! revision.

use serde_json::Value as Json;
use tracing::{debug, error, info, warn};

use super::delta::{Delta, ExclusionPolicy};
use super::segment::{self, base_path, Entry};
use super::{commit_entries, write_initial_files};
use crate::config::ChangelogConfig;
use crate::scene::SceneRef;
use crate::Result;

pub struct InMemoryChangelog {
    config: ChangelogConfig,
    policy: ExclusionPolicy,
    /// State the next delta is computed against.
    baseline: Json,
    /// State as of the last commit (or session start).
    committed: Json,
    pending: Vec<Entry>,
}

impl InMemoryChangelog {
    /// Start a session with the scene's current state as the baseline.
    pub fn begin(scene: &dyn SceneRef, config: &ChangelogConfig) -> Result<Self> {
        let baseline = scene.serialize();
        debug!(scene = %scene.filename(), rev = scene.rev(), "changelog session started");
        Ok(Self {
            config: config.clone(),
            policy: config.policy()?,
            committed: baseline.clone(),
            baseline,
            pending: Vec::new(),
        })
    }

    /// Diff the scene against the baseline and stage the result.
    ///
    /// The returned revision is provisional: `scene.rev + pending + 1`.
    pub fn append_delta(&mut self, scene: &dyn SceneRef, meta: Json) -> Option<u64> {
        let current = scene.serialize();
        let delta = Delta::compute(&self.baseline, &current, &self.policy);
        if delta.is_empty() {
            return None;
        }
        let rev = scene.rev() + self.pending.len() as u64 + 1;
        self.pending.push(Entry::new(rev, delta, meta));
        self.baseline = current;
        Some(rev)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &[Entry] {
        &self.pending
    }

    /// Write every pending entry and the latest snapshot.
    ///
    /// Revisions are renumbered after the last revision on disk. Returns
    /// the final revision, or `None` when nothing was pending.
    pub fn commit(&mut self, scene: &dyn SceneRef) -> Result<Option<u64>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.save_base(scene)?;

        let latest = segment::latest_rev(&segment::load_segments(scene)?);
        let entries: Vec<Entry> = self
            .pending
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mut entry)| {
                entry.rev = latest + i as u64 + 1;
                entry
            })
            .collect();
        let final_rev = latest + entries.len() as u64;
        let count = entries.len();

        commit_entries(scene, entries, &self.baseline, self.config.max_segment_bytes)
            .inspect_err(|e| error!(scene = %scene.filename(), error = %e, pending = count, "changelog commit failed"))?;

        scene.set_rev(final_rev);
        self.committed = self.baseline.clone();
        self.pending.clear();
        info!(scene = %scene.filename(), rev = final_rev, entries = count, "changelog session committed");
        Ok(Some(final_rev))
    }

    /// Create the base snapshot from the last committed state if none exists.
    ///
    /// Pending changes are left out so they are not recorded twice.
    pub fn save_base(&self, scene: &dyn SceneRef) -> Result<()> {
        if base_path(scene).exists() {
            return Ok(());
        }
        write_initial_files(scene, &self.committed)
    }
}

impl Drop for InMemoryChangelog {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "changelog session dropped with uncommitted changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Doc {
        dir: PathBuf,
        data: Mutex<Json>,
        rev: AtomicU64,
    }

    impl SceneRef for Doc {
        fn serialize(&self) -> Json {
            self.data.lock().clone()
        }
        fn rev(&self) -> u64 {
            self.rev.load(Ordering::SeqCst)
        }
        fn set_rev(&self, rev: u64) {
            self.rev.store(rev, Ordering::SeqCst);
        }
        fn save_dir(&self) -> PathBuf {
            self.dir.clone()
        }
        fn filename(&self) -> String {
            "doc.json".into()
        }
    }

    #[test]
    fn test_provisional_then_final_revisions() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = Doc { dir: tmp.path().into(), data: Mutex::new(json!({"n": 0})), rev: AtomicU64::new(0) };
        let mut session = InMemoryChangelog::begin(&doc, &ChangelogConfig::default()).unwrap();

        assert_eq!(session.append_delta(&doc, json!({})), None);
        *doc.data.lock() = json!({"n": 1});
        assert_eq!(session.append_delta(&doc, json!({"step": 1})), Some(1));
        *doc.data.lock() = json!({"n": 2});
        assert_eq!(session.append_delta(&doc, json!({"step": 2})), Some(2));
        assert!(session.has_pending_changes());

        // nothing on disk until commit
        assert!(!base_path(&doc).exists());

        assert_eq!(session.commit(&doc).unwrap(), Some(2));
        assert_eq!(doc.rev(), 2);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(crate::changelog::reconstruct_scene_data(&doc, Some(0)).unwrap(), json!({"n": 0}));
        assert_eq!(crate::changelog::reconstruct_scene_data(&doc, Some(2)).unwrap(), json!({"n": 2}));

        // continues from the committed baseline
        *doc.data.lock() = json!({"n": 3});
        assert_eq!(session.append_delta(&doc, json!({})), Some(3));
        assert_eq!(session.commit(&doc).unwrap(), Some(3));
        assert_eq!(session.commit(&doc).unwrap(), None);
    }

    #[test]
    fn test_save_base_ignores_pending_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = Doc { dir: tmp.path().into(), data: Mutex::new(json!({"n": 0})), rev: AtomicU64::new(0) };
        let mut session = InMemoryChangelog::begin(&doc, &ChangelogConfig::default()).unwrap();
        *doc.data.lock() = json!({"n": 5});
        session.append_delta(&doc, json!({}));

        session.save_base(&doc).unwrap();
        let base: Json = serde_json::from_slice(&std::fs::read(base_path(&doc)).unwrap()).unwrap();
        assert_eq!(base, json!({"n": 0}));

        session.commit(&doc).unwrap();
        assert_eq!(crate::changelog::list_revisions(&doc).unwrap(), vec![1]);
    }

    #[test]
    fn test_failed_commit_keeps_pending() {
        let tmp = tempfile::tempdir().unwrap();
        // a file where the changelog directory should be
        std::fs::write(tmp.path().join("changelog"), b"").unwrap();
        let doc = Doc { dir: tmp.path().into(), data: Mutex::new(json!({"n": 0})), rev: AtomicU64::new(0) };
        let mut session = InMemoryChangelog::begin(&doc, &ChangelogConfig::default()).unwrap();
        *doc.data.lock() = json!({"n": 1});
        session.append_delta(&doc, json!({}));

        assert!(session.commit(&doc).is_err());
        assert_eq!(session.pending_count(), 1);
        assert_eq!(doc.rev(), 0);
    }
}
