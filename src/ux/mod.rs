//! # UX elements
//!
//! Interactive prompts presented to the user while a graph waits.
//!
//! Wire envelopes (published as [`signals::UX`]):
//!
//! ```text
//! → {type: "ux", action: "present", id, data: {element}}
//! → {type: "ux", action: "close",   id, data: {ux_id, cancelled, timed_out}}
//! ← {type: "ux", action: "select",  ux_id, kind, selected, choice_id?, value?, label?}
//! ← {type: "ux", action: "cancel",  ux_id, kind}
//! ```
//!
//! A waiting node parks `"waiting"` under `_ux_<id>` in [`SharedState`];
//! [`handle_message`] replaces it with the selection.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

use crate::model::Value;
use crate::signals::{self, SignalBus};
use crate::state::{SharedState, UxSlot};
use crate::{Error, Result};

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UxChoice {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub value: Json,
    #[serde(default)]
    pub disabled: bool,
}

fn yes() -> bool {
    true
}

/// Fields every element carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UxCommon {
    pub id: String,
    #[serde(default = "yes")]
    pub closable: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Json>,
    /// 0 waits until the user answers.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub timeout_started_at_ms: Option<i64>,
}

impl UxCommon {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            closable: true,
            title: None,
            body: None,
            icon: None,
            color: None,
            meta: Map::new(),
            timeout_seconds: 0,
            timeout_started_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceElement {
    #[serde(flatten)]
    pub common: UxCommon,
    #[serde(default)]
    pub choices: Vec<UxChoice>,
    #[serde(default)]
    pub multi_select: bool,
    #[serde(default)]
    pub default: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInputElement {
    #[serde(flatten)]
    pub common: UxCommon,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default)]
    pub rows: Option<u32>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default = "yes")]
    pub trim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UxElement {
    Choice(ChoiceElement),
    TextInput(TextInputElement),
}

impl UxElement {
    pub fn common(&self) -> &UxCommon {
        match self {
            UxElement::Choice(e) => &e.common,
            UxElement::TextInput(e) => &e.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut UxCommon {
        match self {
            UxElement::Choice(e) => &mut e.common,
            UxElement::TextInput(e) => &mut e.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UxElement::Choice(_) => "choice",
            UxElement::TextInput(_) => "text_input",
        }
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }

    pub fn from_json(json: &Json) -> Result<Self> {
        Ok(serde_json::from_value(json.clone())?)
    }
}

/// What the user answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UxSelection {
    pub ux_id: String,
    pub kind: String,
    #[serde(default)]
    pub selected: Json,
    #[serde(default)]
    pub choice_id: Option<String>,
    #[serde(default)]
    pub value: Json,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub raw: Json,
}

impl UxSelection {
    /// Interpret whatever was stored under a wait key.
    pub fn parse(ux_id: &str, payload: &Json) -> Self {
        if let Ok(selection) = serde_json::from_value::<UxSelection>(payload.clone()) {
            return selection;
        }
        match payload {
            Json::Object(obj) => Self {
                ux_id: ux_id.to_string(),
                kind: obj.get("kind").and_then(Json::as_str).unwrap_or("choice").to_string(),
                selected: obj.get("selected").cloned().unwrap_or(Json::Null),
                choice_id: None,
                value: Json::Null,
                label: None,
                cancelled: obj.get("cancelled").and_then(Json::as_bool).unwrap_or(false),
                raw: payload.clone(),
            },
            other => Self {
                ux_id: ux_id.to_string(),
                kind: "choice".into(),
                selected: other.clone(),
                choice_id: None,
                value: Json::Null,
                label: None,
                cancelled: false,
                raw: Json::Object(Map::new()),
            },
        }
    }
}

// ============================================================================
// Choices
// ============================================================================

fn choice(i: usize, label: String, value: Json) -> UxChoice {
    UxChoice { id: format!("choice_{i}"), label, value, disabled: false }
}

fn label_of(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Accepts a list of strings or objects, a label→value mapping, a JSON
/// string of either, or newline-separated text.
pub fn normalize_choices(raw: &Json) -> Vec<UxChoice> {
    match raw {
        Json::Null => Vec::new(),
        Json::String(text) => {
            let stripped = text.trim();
            match serde_json::from_str::<Json>(stripped) {
                Ok(parsed) if !parsed.is_string() => normalize_choices(&parsed),
                _ => text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .enumerate()
                    .map(|(i, l)| choice(i, l.to_string(), Json::String(l.to_string())))
                    .collect(),
            }
        }
        Json::Object(map) => map
            .iter()
            .enumerate()
            .map(|(i, (label, value))| choice(i, label.clone(), value.clone()))
            .collect(),
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Json::String(s) => choice(i, s.clone(), item.clone()),
                Json::Object(obj) => {
                    let id = obj
                        .get("id")
                        .and_then(Json::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("choice_{i}"));
                    let disabled = obj.get("disabled").and_then(Json::as_bool).unwrap_or(false);
                    match obj.get("label") {
                        Some(label) => UxChoice {
                            id,
                            label: label_of(label),
                            value: obj.get("value").cloned().unwrap_or(Json::Null),
                            disabled,
                        },
                        None => {
                            // {<label>: <value>}
                            let mut rest = obj.iter().filter(|(k, _)| k.as_str() != "id");
                            match (rest.next(), rest.next()) {
                                (Some((label, value)), None) => {
                                    UxChoice { id, label: label.clone(), value: value.clone(), disabled }
                                }
                                _ => UxChoice { id, label: item.to_string(), value: item.clone(), disabled },
                            }
                        }
                    }
                }
                other => choice(i, label_of(other), other.clone()),
            })
            .collect(),
        other => vec![choice(0, label_of(other), other.clone())],
    }
}

// ============================================================================
// Wire
// ============================================================================

fn envelope(action: &str, id: &str, data: Json) -> Json {
    json!({"type": "ux", "action": action, "id": id, "data": data})
}

/// Publish a `present` envelope for `element`.
pub fn present(bus: &SignalBus, element: &UxElement) {
    bus.publish(signals::UX, envelope("present", element.id(), json!({"element": element.to_json()})));
}

/// Publishes `close` for an element when dropped, so cancelled waits still
/// close their element.
pub struct CloseOnDrop<'a> {
    bus: &'a SignalBus,
    id: String,
    pub data: Json,
}

impl<'a> CloseOnDrop<'a> {
    pub fn new(bus: &'a SignalBus, id: &str) -> Self {
        Self { bus, id: id.to_string(), data: json!({"ux_id": id, "cancelled": true, "timed_out": false}) }
    }
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.bus.publish(signals::UX, envelope("close", &self.id, data));
    }
}

/// Apply an incoming `select`/`cancel` envelope. Returns the stored
/// selection, or `None` for other actions.
pub fn handle_message(shared: &SharedState, bus: &SignalBus, message: &Json) -> Result<Option<UxSelection>> {
    let action = message.get("action").and_then(Json::as_str).unwrap_or_default();
    if !matches!(action, "select" | "cancel") {
        return Ok(None);
    }
    let ux_id = message
        .get("ux_id")
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::DataParsing { message: "ux message without ux_id".into(), data: Some(message.to_string()) })?;
    let field = |name: &str| message.get(name).cloned().unwrap_or(Json::Null);
    let kind = message.get("kind").and_then(Json::as_str).unwrap_or("choice").to_string();

    let selection = if action == "select" {
        UxSelection {
            ux_id: ux_id.to_string(),
            kind,
            selected: field("selected"),
            choice_id: message.get("choice_id").and_then(Json::as_str).map(str::to_string),
            value: field("value"),
            label: message.get("label").and_then(Json::as_str).map(str::to_string),
            cancelled: false,
            raw: message.clone(),
        }
    } else {
        UxSelection {
            ux_id: ux_id.to_string(),
            kind,
            selected: Json::Null,
            choice_id: None,
            value: Json::Null,
            label: None,
            cancelled: true,
            raw: message.clone(),
        }
    };

    let stored = serde_json::to_value(&selection)?;
    debug!(ux_id, action, "ux selection received");
    shared.set(&SharedState::ux_key(ux_id), Value::from_json(&stored));
    bus.publish(signals::UX_SELECTED, stored);
    Ok(Some(selection))
}

// ============================================================================
// Waiting
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Selected(UxSelection),
    TimedOut,
    /// The scene became inactive mid-wait.
    Aborted,
}

struct ClearOnDrop<'a> {
    shared: &'a SharedState,
    ux_id: &'a str,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.shared.clear_ux(self.ux_id);
    }
}

/// Poll `_ux_<id>` until it holds a selection, the timeout expires, or the
/// scene goes inactive. A selection delivered before the wait started is
/// picked up immediately. The key is cleared on every exit path.
pub async fn wait_for_interaction(
    shared: &SharedState,
    ux_id: &str,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> WaitOutcome {
    let started = Instant::now();
    let _clear = ClearOnDrop { shared, ux_id };
    loop {
        match shared.poll_ux(ux_id) {
            UxSlot::Resolved(value) => return WaitOutcome::Selected(UxSelection::parse(ux_id, &value.to_json())),
            UxSlot::Missing => shared.begin_ux_wait(ux_id),
            UxSlot::Waiting => {}
        }
        if !shared.scene_active() {
            debug!(ux_id, "scene inactive, aborting ux wait");
            return WaitOutcome::Aborted;
        }
        if timeout.is_some_and(|t| started.elapsed() >= t) {
            debug!(ux_id, "ux wait timed out");
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Outputs of a finished interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub value: Value,
    pub values: Json,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl Interaction {
    pub fn from_outcome(element: &UxElement, outcome: WaitOutcome) -> Self {
        let mut values = json!({
            "ux_id": element.id(),
            "kind": element.kind(),
            "value": null,
            "text": null,
            "choice_id": null,
            "label": null,
            "cancelled": true,
            "timed_out": false,
            "raw": {},
        });
        match outcome {
            WaitOutcome::TimedOut => {
                values["timed_out"] = json!(true);
                values["raw"] = json!({"reason": "timeout"});
                Self { value: Value::Null, values, cancelled: true, timed_out: true }
            }
            WaitOutcome::Aborted => {
                values["raw"] = json!({"reason": "scene_inactive"});
                Self { value: Value::Null, values, cancelled: true, timed_out: false }
            }
            WaitOutcome::Selected(selection) => {
                let mut selected = selection.selected.clone();
                if let (UxElement::TextInput(e), Json::String(s)) = (element, &selected) {
                    if e.trim {
                        selected = Json::String(s.trim().to_string());
                    }
                }
                let is_text = matches!(element, UxElement::TextInput(_));
                values["value"] = selected.clone();
                values["text"] = if is_text { selected.clone() } else { Json::Null };
                values["choice_id"] = json!(selection.choice_id);
                values["label"] = json!(selection.label);
                values["cancelled"] = json!(selection.cancelled);
                values["raw"] = if selection.raw.is_null() { json!({}) } else { selection.raw.clone() };
                Self { value: Value::from_json(&selected), values, cancelled: selection.cancelled, timed_out: false }
            }
        }
    }
}

/// Present `element`, wait for the user and close it again.
pub async fn interact(
    shared: &SharedState,
    bus: &SignalBus,
    mut element: UxElement,
    poll_interval: Duration,
) -> (UxElement, Interaction) {
    let timeout_seconds = element.common().timeout_seconds;
    element.common_mut().timeout_started_at_ms = (timeout_seconds > 0).then(|| Utc::now().timestamp_millis());
    let timeout = (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds));

    let ux_id = element.id().to_string();
    present(bus, &element);
    let mut close = CloseOnDrop::new(bus, &ux_id);

    let outcome = wait_for_interaction(shared, &ux_id, timeout, poll_interval).await;
    let interaction = Interaction::from_outcome(&element, outcome);
    close.data = json!({"ux_id": ux_id, "cancelled": interaction.cancelled, "timed_out": interaction.timed_out});
    drop(close);
    (element, interaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_choices_forms() {
        let from_list = normalize_choices(&json!(["a", {"label": "B", "value": 2}, {"C": 3}]));
        assert_eq!(from_list[0].id, "choice_0");
        assert_eq!(from_list[1].label, "B");
        assert_eq!(from_list[1].value, json!(2));
        assert_eq!(from_list[2].label, "C");
        assert_eq!(from_list[2].value, json!(3));

        let from_lines = normalize_choices(&json!("one\n\n two \n"));
        assert_eq!(from_lines.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);

        let from_json_string = normalize_choices(&json!(r#"{"yes": true, "no": false}"#));
        assert_eq!(from_json_string.len(), 2);
        assert_eq!(from_json_string[0].id, "choice_0");

        assert!(normalize_choices(&Json::Null).is_empty());
        assert_eq!(normalize_choices(&json!(5))[0].label, "5");
    }

    #[test]
    fn test_element_tagging() {
        let element = UxElement::Choice(ChoiceElement {
            common: UxCommon::new("u1"),
            choices: normalize_choices(&json!(["a"])),
            multi_select: false,
            default: Json::Null,
        });
        let wire = element.to_json();
        assert_eq!(wire["kind"], "choice");
        assert_eq!(wire["id"], "u1");
        assert_eq!(UxElement::from_json(&wire).unwrap(), element);
    }

    #[test]
    fn test_handle_message_select_and_cancel() {
        let shared = SharedState::new();
        let bus = SignalBus::new();
        let mut rx = bus.subscribe_to(signals::UX_SELECTED);
        shared.begin_ux_wait("u1");

        let msg = json!({"type": "ux", "action": "select", "ux_id": "u1", "selected": "a", "choice_id": "choice_0"});
        let selection = handle_message(&shared, &bus, &msg).unwrap().unwrap();
        assert_eq!(selection.choice_id.as_deref(), Some("choice_0"));
        assert!(matches!(shared.poll_ux("u1"), UxSlot::Resolved(_)));
        assert_eq!(rx.try_recv().unwrap().payload["selected"], "a");

        let cancel = json!({"type": "ux", "action": "cancel", "ux_id": "u2"});
        assert!(handle_message(&shared, &bus, &cancel).unwrap().unwrap().cancelled);

        assert!(handle_message(&shared, &bus, &json!({"action": "present"})).unwrap().is_none());
        assert!(handle_message(&shared, &bus, &json!({"action": "select"})).is_err());
    }

    #[tokio::test]
    async fn test_selection_before_wait_is_used() {
        let shared = SharedState::new();
        let bus = SignalBus::new();
        handle_message(&shared, &bus, &json!({"action": "select", "ux_id": "early", "selected": "x"})).unwrap();
        let outcome = wait_for_interaction(&shared, "early", None, Duration::from_millis(10)).await;
        assert!(matches!(outcome, WaitOutcome::Selected(s) if s.selected == json!("x")));
        assert_eq!(shared.poll_ux("early"), UxSlot::Missing);
    }
}
