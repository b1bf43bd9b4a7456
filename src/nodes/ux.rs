//! `ux/*` nodes: build interactive elements and wait for the user.

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::model::{PropertyField, PropertyType, Socket, Value};
use crate::node::{Node, NodeContext, NodeKind, NodeStyle};
use crate::ux::{self, ChoiceElement, TextInputElement, UxCommon, UxElement};
use crate::{Error, Result};

fn common_fields() -> Vec<PropertyField> {
    vec![
        PropertyField::new("ux_id", PropertyType::Str, "").describe("Element id, generated when empty"),
        PropertyField::new("title", PropertyType::Str, "").describe("Title"),
        PropertyField::new("body", PropertyType::Text, "").describe("Body"),
        PropertyField::new("timeout_seconds", PropertyType::Int, 0)
            .describe("Seconds before the element times out, 0 waits forever")
            .range(0.0, 3600.0, 1.0),
    ]
}

fn non_empty(value: Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Shared element fields from the node's inputs and properties.
fn common(ctx: &NodeContext<'_>) -> UxCommon {
    let id = non_empty(ctx.get_input_value("ux_id")).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut common = UxCommon::new(&id);
    common.title = non_empty(ctx.get_input_value("title"));
    common.body = non_empty(ctx.get_input_value("body"));
    common.timeout_seconds = ctx.get_input_value("timeout_seconds").as_int().unwrap_or(0).max(0) as u64;
    common
}

fn element_output(ctx: &NodeContext<'_>, element: &UxElement) {
    debug!(node = %ctx.node.title, ux_id = element.id(), kind = element.kind(), "ux element built");
    ctx.set_output("ux_element", Value::from_json(&element.to_json()));
}

// ============================================================================
// Builders
// ============================================================================

struct BuildChoiceKind;

#[async_trait]
impl NodeKind for BuildChoiceKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let choices = ctx.require_input("choices")?.to_json();
        let element = UxElement::Choice(ChoiceElement {
            common: common(ctx),
            choices: ux::normalize_choices(&choices),
            multi_select: ctx.get_input_value("multi_select").is_truthy(),
            default: match ctx.get_input_value("default") {
                Value::Unresolved => Json::Null,
                v => v.to_json(),
            },
        });
        element_output(ctx, &element);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        let mut fields = common_fields();
        fields.push(PropertyField::new("multi_select", PropertyType::Bool, false).describe("Allow several choices"));
        fields.push(PropertyField::new("default", PropertyType::Any, Value::Null).describe("Preselected value"));
        fields
    }
}

pub fn build_choice_element() -> Node {
    Node::new("ux/BuildChoiceElement", "Build Choice Element", BuildChoiceKind)
        .input("choices", "any")
        .input_socket(Socket::new("ux_id").typed("str").optional())
        .input_socket(Socket::new("title").typed("str").optional())
        .input_socket(Socket::new("body").typed("str").optional())
        .output("ux_element", "dict")
        .styled(NodeStyle::colors("#2e5740", "#2c3932", "F0135"))
}

struct BuildTextInputKind;

#[async_trait]
impl NodeKind for BuildTextInputKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let rows = ctx.get_input_value("rows").as_int().filter(|r| *r > 0).map(|r| r as u32);
        let element = UxElement::TextInput(TextInputElement {
            common: common(ctx),
            multiline: ctx.get_input_value("multiline").is_truthy(),
            rows,
            placeholder: non_empty(ctx.get_input_value("placeholder")),
            default: non_empty(ctx.get_input_value("default")),
            trim: ctx.get_input_value("trim").is_truthy(),
        });
        element_output(ctx, &element);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        let mut fields = common_fields();
        fields.extend([
            PropertyField::new("multiline", PropertyType::Bool, false).describe("Multiline"),
            PropertyField::new("rows", PropertyType::Int, 0).describe("Visible rows, 0 for the default"),
            PropertyField::new("placeholder", PropertyType::Str, "").describe("Placeholder"),
            PropertyField::new("default", PropertyType::Text, "").describe("Prefilled text"),
            PropertyField::new("trim", PropertyType::Bool, true).describe("Trim surrounding whitespace"),
        ]);
        fields
    }
}

pub fn build_text_input_element() -> Node {
    Node::new("ux/BuildTextInputElement", "Build Text Input Element", BuildTextInputKind)
        .input_socket(Socket::new("ux_id").typed("str").optional())
        .input_socket(Socket::new("title").typed("str").optional())
        .input_socket(Socket::new("body").typed("str").optional())
        .input_socket(Socket::new("default").typed("str").optional())
        .output("ux_element", "dict")
        .styled(NodeStyle::colors("#2e5740", "#2c3932", "F0133"))
}

// ============================================================================
// Emit
// ============================================================================

/// Presents an element and blocks until it is answered, cancelled or times out.
struct EmitElementKind;

#[async_trait]
impl NodeKind for EmitElementKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let raw = ctx.require_value("ux_element")?.to_json();
        let element = UxElement::from_json(&raw).map_err(|e| {
            Error::input(&ctx.node.title, "ux_element", format!("not a ux element: {e}"))
        })?;
        let state = ctx.get_input_value("state");

        let interval = ctx.runtime().config.poll_interval();
        let (element, interaction) = ux::interact(ctx.shared(), ctx.state.bus(), element, interval).await;
        info!(
            node = %ctx.node.title,
            ux_id = element.id(),
            cancelled = interaction.cancelled,
            timed_out = interaction.timed_out,
            "ux interaction finished"
        );

        ctx.set_output_values([
            ("state", state),
            ("ux_id", Value::from(element.id())),
            ("ux_element", Value::from_json(&element.to_json())),
            ("value", interaction.value),
            ("values", Value::from_json(&interaction.values)),
            ("cancelled", Value::Bool(interaction.cancelled)),
            ("timed_out", Value::Bool(interaction.timed_out)),
        ]);
        Ok(())
    }
}

pub fn emit_element() -> Node {
    Node::new("ux/EmitElement", "Emit UX Element", EmitElementKind)
        .input_socket(Socket::new("state").optional())
        .input("ux_element", "dict")
        .output("state", "any")
        .output("ux_id", "str")
        .output("ux_element", "dict")
        .output("value", "any")
        .output("values", "dict")
        .output("cancelled", "bool")
        .output("timed_out", "bool")
        .styled(NodeStyle::colors("#2e5740", "#2c3932", "F0B79"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::run;
    use crate::graph::Graph;
    use crate::registry::global;
    use crate::state::{GraphState, Runtime};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_build_choice_element() {
        let mut graph = Graph::new("g");
        let build = graph.add_node(global().create("ux/BuildChoiceElement").unwrap());
        graph.set_node_property(&build, "choices", Value::from(vec!["left", "right"])).unwrap();
        graph.set_node_property(&build, "ux_id", Value::from("pick")).unwrap();
        graph.set_node_property(&build, "title", Value::from("Where to?")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        let element = UxElement::from_json(&inner.output(&build, "ux_element").to_json()).unwrap();
        let UxElement::Choice(choice) = element else { panic!("expected a choice element") };
        assert_eq!(choice.common.id, "pick");
        assert_eq!(choice.common.title.as_deref(), Some("Where to?"));
        assert_eq!(choice.common.body, None);
        assert_eq!(choice.choices.len(), 2);
        assert_eq!(choice.choices[1].value, json!("right"));
    }

    #[tokio::test]
    async fn test_text_input_generates_id() {
        let mut graph = Graph::new("g");
        let build = graph.add_node(global().create("ux/BuildTextInputElement").unwrap());
        graph.set_node_property(&build, "rows", Value::from(4)).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        let element = UxElement::from_json(&inner.output(&build, "ux_element").to_json()).unwrap();
        let UxElement::TextInput(text) = element else { panic!("expected a text input element") };
        assert!(!text.common.id.is_empty());
        assert_eq!(text.rows, Some(4));
        assert!(text.trim);
    }
}
