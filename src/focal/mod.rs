//! # Focal
//!
//! Turns callables into capabilities an LLM can invoke by name.
//!
//! ```text
//! Callback(s) ──▶ prompt (renderer) ──▶ LlmClient ──▶ parse ──▶ dispatch ──▶ Call records
//! ```
//!
//! | Type | Role |
//! |------|------|
//! | [`Argument`] | declared parameter of a callback |
//! | [`Callback`] | named capability with its arguments and callable |
//! | [`Call`] | record of one invocation requested by the model |
//! | [`Focal`] | one request: render, send, parse, dispatch |
//!
//! Calls are dispatched in the order the model emitted them. A model
//! naming an unknown callback produces an error record and dispatch
//! continues; a user rejection ([`Error::ActionRejected`]) stops the
//! request and propagates to the caller.

pub mod parse;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, error, warn};

use crate::llm::{LlmClient, PromptRenderer};
use crate::model::{PropertyMap, Value};
use crate::state::GraphState;
use crate::{Error, Result};

pub use parse::{extract_calls, extract_json, fix_faulty_json};

/// Prompt kind handed to the client with every focal request.
pub const DEFAULT_KIND: &str = "analyze_long";

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Argument {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Argument {
    pub fn new(name: &str, kind: &str) -> Self {
        Self { name: name.to_string(), kind: kind.to_string() }
    }
}

/// Something a [`Callback`] can invoke.
#[async_trait]
pub trait CallbackFn: Send + Sync {
    async fn call(&self, state: &GraphState, arguments: PropertyMap) -> Result<Value>;
}

struct ClosureFn<F>(F);

#[async_trait]
impl<F, Fut> CallbackFn for ClosureFn<F>
where
    F: Fn(PropertyMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, _state: &GraphState, arguments: PropertyMap) -> Result<Value> {
        (self.0)(arguments).await
    }
}

/// Wrap an async closure as a [`CallbackFn`].
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn CallbackFn>
where
    F: Fn(PropertyMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(ClosureFn(f))
}

pub struct Callback {
    pub name: String,
    pub arguments: Vec<Argument>,
    pub func: Arc<dyn CallbackFn>,
    /// Whether the model may call this more than once per request.
    pub multiple: bool,
    pub instructions: Option<String>,
    pub examples: Vec<Json>,
}

impl Callback {
    pub fn new(name: &str, func: Arc<dyn CallbackFn>) -> Self {
        Self {
            name: name.to_string(),
            arguments: Vec::new(),
            func,
            multiple: true,
            instructions: None,
            examples: Vec::new(),
        }
    }

    pub fn argument(mut self, name: &str, kind: &str) -> Self {
        self.arguments.push(Argument::new(name, kind));
        self
    }

    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn instructions(mut self, text: &str) -> Self {
        self.instructions = Some(text.to_string());
        self
    }

    pub fn example(mut self, example: Json) -> Self {
        self.examples.push(example);
        self
    }

    /// `"add_character"` → `"Add Character"`.
    pub fn pretty_name(&self) -> String {
        self.name
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                chars
                    .next()
                    .map(|first| first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect::<String>())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Pretty JSON call skeleton with `"<type> - <usage>"` per argument.
    pub fn json_usage(&self, argument_usage: &BTreeMap<String, String>) -> String {
        let arguments: Map<String, Json> = self
            .arguments
            .iter()
            .map(|a| {
                let usage = argument_usage.get(&a.name).map(String::as_str).unwrap_or("");
                (a.name.clone(), Json::String(format!("{} - {usage}", a.kind)))
            })
            .collect();
        to_pretty(&json!({"function": self.name, "arguments": arguments}))
    }

    pub fn json_example(&self, example: &Json) -> String {
        to_pretty(&json!({"function": self.name, "arguments": example}))
    }

    /// One-line signature followed by the instructions, if any.
    pub fn usage(&self) -> String {
        let args: Vec<String> = self.arguments.iter().map(|a| format!("{}: {}", a.name, a.kind)).collect();
        match &self.instructions {
            Some(text) => format!("{}({}) - {text}", self.name, args.join(", ")),
            None => format!("{}({})", self.name, args.join(", ")),
        }
    }

    /// Render the `focal.callback` template for this callback.
    pub fn render(
        &self,
        renderer: &dyn PromptRenderer,
        usage: &str,
        examples: &[Json],
        argument_usage: &BTreeMap<String, String>,
    ) -> Result<String> {
        let examples: Vec<String> = examples.iter().chain(&self.examples).map(|e| self.json_example(e)).collect();
        renderer.render(
            "focal.callback",
            &json!({
                "name": self.name,
                "pretty_name": self.pretty_name(),
                "usage": usage,
                "json_usage": self.json_usage(argument_usage),
                "arguments": self.arguments,
                "argument_usage": argument_usage,
                "examples": examples,
            }),
        )
    }

    fn describe(&self) -> Json {
        json!({
            "name": self.name,
            "usage": self.usage(),
            "arguments": self.arguments,
            "instructions": self.instructions,
            "examples": self.examples.iter().map(|e| self.json_example(e)).collect::<Vec<_>>(),
            "multiple": self.multiple,
        })
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("multiple", &self.multiple)
            .finish()
    }
}

fn to_pretty(json: &Json) -> String {
    serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub uid: String,
    pub name: String,
    pub arguments: PropertyMap,
    pub result: Value,
    pub called: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Call {
    pub fn new(name: &str, arguments: PropertyMap) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            arguments,
            result: Value::Null,
            called: false,
            error: None,
        }
    }

    /// Accepts `{name|function, arguments}`. List arguments are joined
    /// into newline-separated text.
    pub fn from_json(json: &Json) -> Option<Self> {
        let obj = json.as_object()?;
        let name = obj.get("name").or_else(|| obj.get("function"))?.as_str()?;
        let arguments = obj
            .get("arguments")
            .and_then(Json::as_object)
            .map(|args| {
                args.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Json::Array(items) => Value::String(
                                items
                                    .iter()
                                    .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                            ),
                            other => Value::from_json(other),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self::new(name, arguments))
    }
}

/// Flatten `calls`. With `nested`, calls whose result is itself a list of
/// calls contribute those too. `filter` decides which calls are kept; nested
/// results are walked regardless.
pub fn collect_calls(calls: &[Call], nested: bool, filter: Option<&dyn Fn(&Call) -> bool>) -> Vec<Call> {
    let mut out = Vec::new();
    for call in calls {
        if filter.is_none_or(|f| f(call)) {
            out.push(call.clone());
        }
        if !nested {
            continue;
        }
        if let Some(items) = call.result.as_list() {
            let inner: Option<Vec<Call>> = items
                .iter()
                .map(|v| match v {
                    Value::Call(c) => Some(c.as_ref().clone()),
                    _ => None,
                })
                .collect();
            if let Some(inner) = inner.filter(|v| !v.is_empty()) {
                out.extend(collect_calls(&inner, true, filter));
            }
        }
    }
    out
}

// ============================================================================
// Handler
// ============================================================================

/// One Focal request against an LLM client.
pub struct Focal {
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
    callbacks: Vec<Arc<Callback>>,
    max_calls: usize,
    retries: usize,
    context: Map<String, Json>,
    calls: Vec<Call>,
}

impl Focal {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>, callbacks: Vec<Arc<Callback>>) -> Self {
        Self {
            client,
            renderer,
            callbacks,
            max_calls: 5,
            retries: 0,
            context: Map::new(),
            calls: Vec::new(),
        }
    }

    pub fn max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = max_calls;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Extra template variable.
    pub fn context(mut self, key: &str, value: Json) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn into_calls(self) -> Vec<Call> {
        self.calls
    }

    fn callback(&self, name: &str) -> Option<&Arc<Callback>> {
        self.callbacks.iter().find(|c| c.name == name)
    }

    pub fn prompt_vars(&self) -> Json {
        let mut vars = self.context.clone();
        vars.insert("callbacks".into(), Json::Array(self.callbacks.iter().map(|c| c.describe()).collect()));
        vars.insert("max_calls".into(), json!(self.max_calls));
        vars.insert("max_tokens".into(), json!(self.client.max_token_length()));
        Json::Object(vars)
    }

    /// Render `template`, send it and dispatch the returned calls.
    ///
    /// The request is re-sent (up to `retries` times) only while a round
    /// produced no successfully executed call. Returns the last response.
    pub async fn request(&mut self, state: &GraphState, template: &str) -> Result<String> {
        if self.max_calls == 0 {
            debug!(template, "max_calls is 0, skipping request");
            return Ok(String::new());
        }
        let prompt = self.renderer.render(template, &self.prompt_vars())?;

        let mut response = String::new();
        for attempt in 0..=self.retries {
            response = self.client.send_prompt(&prompt, DEFAULT_KIND).await?;
            if response.trim().is_empty() {
                warn!(template, attempt, "empty focal response");
                continue;
            }
            let calls = match extract_calls(&response) {
                Ok(calls) => calls,
                Err(e) if attempt < self.retries => {
                    warn!(template, attempt, error = %e, "unparsable focal response, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.execute(state, calls).await? > 0 {
                break;
            }
        }
        Ok(response)
    }

    /// Dispatch `calls` in order. Returns the number executed successfully.
    pub async fn execute(&mut self, state: &GraphState, calls: Vec<Call>) -> Result<usize> {
        let mut made = 0;
        let mut used: HashSet<String> = HashSet::new();

        for mut call in calls {
            if made >= self.max_calls {
                warn!(max_calls = self.max_calls, "max calls reached");
                break;
            }
            let Some(callback) = self.callback(&call.name).cloned() else {
                let err = Error::UnknownAction(call.name.clone());
                warn!(name = %call.name, "unknown focal callback");
                call.error = Some(err.to_string());
                self.calls.push(call);
                continue;
            };
            if !callback.multiple && used.contains(&callback.name) {
                warn!(name = %call.name, "callback may only be called once per request");
                call.error = Some(format!("{} may only be called once per request", call.name));
                self.calls.push(call);
                continue;
            }

            match callback.func.call(state, call.arguments.clone()).await {
                Ok(result) => {
                    call.result = result;
                    call.called = true;
                    made += 1;
                    used.insert(callback.name.clone());
                    self.calls.push(call);
                }
                Err(e) if e.is_passthrough() => {
                    call.error = Some(e.to_string());
                    self.calls.push(call);
                    return Err(e);
                }
                Err(e) => {
                    error!(callback = %call.name, error = %e, "focal callback failed");
                    call.error = Some(e.to_string());
                    self.calls.push(call);
                }
            }
        }
        Ok(made)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::InstructionRenderer;
    use crate::state::Runtime;
    use pretty_assertions::assert_eq;

    struct Canned(&'static str);

    #[async_trait]
    impl LlmClient for Canned {
        async fn send_prompt(&self, _prompt: &str, _kind: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
        fn max_token_length(&self) -> usize {
            4096
        }
    }

    fn echo() -> Arc<dyn CallbackFn> {
        callback_fn(|args: PropertyMap| async move { Ok(args.get("name").cloned().unwrap_or_default()) })
    }

    #[test]
    fn test_json_usage() {
        let cb = Callback::new("add_char", echo()).argument("name", "str");
        let usage = BTreeMap::from([("name".to_string(), "the character name".to_string())]);
        assert_eq!(
            cb.json_usage(&usage),
            "{\n  \"function\": \"add_char\",\n  \"arguments\": {\n    \"name\": \"str - the character name\"\n  }\n}"
        );
        assert_eq!(cb.pretty_name(), "Add Char");
        assert_eq!(cb.usage(), "add_char(name: str)");
    }

    #[tokio::test]
    async fn test_single_use_callback() {
        let state = GraphState::root(Runtime::default());
        let cb = Arc::new(Callback::new("once", echo()).argument("name", "str").multiple(false));
        let mut focal = Focal::new(Arc::new(Canned("")), Arc::new(InstructionRenderer), vec![cb]);
        let calls = vec![Call::new("once", PropertyMap::new()), Call::new("once", PropertyMap::new())];
        assert_eq!(focal.execute(&state, calls).await.unwrap(), 1);
        assert!(focal.calls()[0].called);
        assert!(!focal.calls()[1].called);
        assert!(focal.calls()[1].error.is_some());
    }

    #[tokio::test]
    async fn test_max_calls_budget() {
        let state = GraphState::root(Runtime::default());
        let cb = Arc::new(Callback::new("add", echo()));
        let client = Arc::new(Canned(r#"[{"name":"add"},{"name":"add"},{"name":"add"}]"#));
        let mut focal = Focal::new(client, Arc::new(InstructionRenderer), vec![cb]).max_calls(2);
        focal.request(&state, "t").await.unwrap();
        assert_eq!(focal.calls().len(), 2);
    }

    #[test]
    fn test_collect_calls_nested() {
        let inner = Call::new("inner", PropertyMap::new());
        let mut outer = Call::new("outer", PropertyMap::new());
        outer.result = Value::List(vec![Value::Call(Arc::new(inner))]);
        let flat = collect_calls(std::slice::from_ref(&outer), true, None);
        assert_eq!(flat.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["outer", "inner"]);

        let only_inner = |c: &Call| c.name == "inner";
        let filtered = collect_calls(&[outer], true, Some(&only_inner));
        assert_eq!(filtered.len(), 1);
    }
}
