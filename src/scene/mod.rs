//! # Scene document
//!
//! The changelog only needs a [`SceneRef`]: something that can serialize
//! itself to plain JSON and knows where its files live. [`Scene`] is the
//! concrete document the runtime ships with.
//!
//! File layout under `save_dir`:
//!
//! ```text
//! <save_dir>/
//! ├── scene.json
//! ├── backups/scene_pre_rollback_<ts>.json
//! └── changelog/
//!     ├── scene.json.base.json
//!     ├── scene.json.latest.json
//!     └── scene.json.changelog.<start_rev>.json
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::state::SharedState;
use crate::Result;

/// What the changelog needs from a scene.
pub trait SceneRef: Send + Sync {
    /// Plain, JSON-only form of the scene. Deterministic for equal states.
    fn serialize(&self) -> Json;

    fn rev(&self) -> u64;

    fn set_rev(&self, rev: u64);

    fn save_dir(&self) -> PathBuf;

    /// Scene file name, e.g. `scene.json`.
    fn filename(&self) -> String;

    fn changelog_dir(&self) -> PathBuf {
        self.save_dir().join("changelog")
    }

    fn backups_dir(&self) -> PathBuf {
        self.save_dir().join("backups")
    }

    fn scene_path(&self) -> PathBuf {
        self.save_dir().join(self.filename())
    }

    /// File name without its extension.
    fn stem(&self) -> String {
        let filename = self.filename();
        Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(filename)
    }
}

/// Serialize anything to plain JSON; values serde cannot represent fall
/// back to their debug string.
pub fn to_plain_json<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> Json {
    serde_json::to_value(value).unwrap_or_else(|_| Json::String(format!("{value:?}")))
}

// ============================================================================
// Concrete scene
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_player: bool,
    #[serde(default)]
    pub attributes: Map<String, Json>,
}

impl Character {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldEntry {
    pub text: String,
    #[serde(default)]
    pub meta: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SceneData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    characters: Vec<Character>,
    #[serde(default)]
    world_entries: BTreeMap<String, WorldEntry>,
    #[serde(default)]
    history: Vec<String>,
    #[serde(default)]
    memory_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shared_context: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Json>,
}

pub struct Scene {
    pub name: String,
    pub description: String,
    pub characters: Vec<Character>,
    pub world_entries: BTreeMap<String, WorldEntry>,
    pub history: Vec<String>,
    pub memory_session_id: String,
    pub shared_context: Option<String>,
    /// Fields this crate does not model, kept verbatim.
    pub extra: Map<String, Json>,
    /// Shared state of the scene's node graphs (UX waits, breakpoints).
    pub nodegraph_state: Arc<SharedState>,
    save_dir: PathBuf,
    filename: String,
    rev: AtomicU64,
}

impl Scene {
    pub fn new(save_dir: impl Into<PathBuf>, filename: &str) -> Self {
        Self::from_data(save_dir.into(), filename, SceneData::default())
    }

    fn from_data(save_dir: PathBuf, filename: &str, data: SceneData) -> Self {
        Self {
            name: data.name,
            description: data.description,
            characters: data.characters,
            world_entries: data.world_entries,
            history: data.history,
            memory_session_id: data.memory_session_id,
            shared_context: data.shared_context,
            extra: data.extra,
            nodegraph_state: Arc::new(SharedState::new()),
            save_dir,
            filename: filename.to_string(),
            rev: AtomicU64::new(0),
        }
    }

    /// Build a scene from its serialized form.
    pub fn from_json(save_dir: impl Into<PathBuf>, filename: &str, json: &Json) -> Result<Self> {
        let data: SceneData = serde_json::from_value(json.clone())?;
        Ok(Self::from_data(save_dir.into(), filename, data))
    }

    /// Load `<save_dir>/<filename>`.
    pub fn load(save_dir: impl Into<PathBuf>, filename: &str) -> Result<Self> {
        let save_dir = save_dir.into();
        let text = fs::read_to_string(save_dir.join(filename))?;
        let json: Json = serde_json::from_str(&text)?;
        Self::from_json(save_dir, filename, &json)
    }

    /// Write the scene file (pretty JSON).
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.scene_path();
        fs::create_dir_all(&self.save_dir)?;
        fs::write(&path, serde_json::to_string_pretty(&self.serialize())?)?;
        Ok(path)
    }

    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.name == name)
    }

    pub fn add_character(&mut self, character: Character) {
        self.characters.push(character);
    }

    pub fn remove_character(&mut self, name: &str) -> Option<Character> {
        let idx = self.characters.iter().position(|c| c.name == name)?;
        Some(self.characters.remove(idx))
    }

    fn data(&self) -> SceneData {
        SceneData {
            name: self.name.clone(),
            description: self.description.clone(),
            characters: self.characters.clone(),
            world_entries: self.world_entries.clone(),
            history: self.history.clone(),
            memory_session_id: self.memory_session_id.clone(),
            shared_context: self.shared_context.clone(),
            extra: self.extra.clone(),
        }
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("rev", &self.rev())
            .field("characters", &self.characters.len())
            .finish()
    }
}

impl SceneRef for Scene {
    fn serialize(&self) -> Json {
        to_plain_json(&self.data())
    }

    fn rev(&self) -> u64 {
        self.rev.load(Ordering::SeqCst)
    }

    fn set_rev(&self, rev: u64) {
        self.rev.store(rev, Ordering::SeqCst);
    }

    fn save_dir(&self) -> PathBuf {
        self.save_dir.clone()
    }

    fn filename(&self) -> String {
        self.filename.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_serialize_is_plain_and_ordered() {
        let mut scene = Scene::new("/tmp/unused", "tavern.json");
        scene.name = "Tavern".into();
        scene.add_character(Character::new("A"));
        scene.extra.insert("custom".into(), json!({"k": 1}));

        let json = scene.serialize();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["name", "description", "characters", "world_entries", "history", "memory_session_id", "custom"]
        );
        assert_eq!(json["characters"][0]["name"], "A");
        assert_eq!(scene.serialize(), json);
    }

    #[test]
    fn test_paths() {
        let scene = Scene::new("/saves/s1", "tavern.json");
        assert_eq!(scene.stem(), "tavern");
        assert_eq!(scene.changelog_dir(), PathBuf::from("/saves/s1/changelog"));
        assert_eq!(scene.backups_dir(), PathBuf::from("/saves/s1/backups"));
        assert_eq!(scene.scene_path(), PathBuf::from("/saves/s1/tavern.json"));
    }

    #[test]
    fn test_from_json_keeps_unknown_fields() {
        let input = json!({"name": "x", "characters": [{"name": "B"}], "weather": "rain", "shared_context": "ctx.json"});
        let scene = Scene::from_json("/tmp", "x.json", &input).unwrap();
        assert_eq!(scene.character("B").map(|c| c.name.as_str()), Some("B"));
        assert_eq!(scene.serialize()["weather"], "rain");
        assert_eq!(scene.serialize()["shared_context"], "ctx.json");
    }
}
