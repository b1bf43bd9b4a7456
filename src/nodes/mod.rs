//! Built-in node kinds.
//!
//! | Namespace | Module | Nodes |
//! |-----------|--------|-------|
//! | `core/`, `raise/`, `event/` | [`base`] | module plumbing, routing, loop control, errors, events |
//! | `state/` | [`state`] | scoped variables |
//! | `core/functions/` | [`function`], [`base`] | arguments, returns, calls, breakpoints |
//! | `focal/`, `agents/` | [`focal`] | LLM call dispatch |
//! | `ux/` | [`ux`] | interactive elements |

pub mod base;
pub mod focal;
pub mod function;
pub mod state;
pub mod ux;

use tracing::debug;

use crate::node::Node;
use crate::registry::Registry;
use crate::Result;

/// Registry names of every built-in node kind.
pub static BUILTIN_NODES: &[&str] = &[
    "core/Input",                          // Module input socket
    "core/Output",                         // Module output socket
    "core/ModuleProperty",                 // Module-level property, coerced to its declared type
    "core/Route",                          // Pass a value through unchanged
    "core/Watch",                          // Pass a value through, logging it in creative mode
    "core/Stage",                          // Order chains of a graph
    "core/Switch",                         // Route to `yes` or `no` by truthiness
    "core/ORRouter",                       // First of several optional inputs
    "core/ANDRouter",                      // Route by all connected flags
    "core/Case",                           // Route by exact match
    "core/Coallesce",                      // First set value
    "core/MakeValue",                      // Constant from a property
    "core/MakeBool",                       // Boolean constant
    "core/ApplyDefault",                   // Fill in an unresolved value
    "core/Invert",                         // Boolean not
    "core/RunModule",                      // Run a registered module in its own state
    "core/LoopBreak",                      // Leave the innermost loop
    "core/LoopContinue",                   // Next iteration of the innermost loop
    "raise/Stop",                          // Raise a named flow signal
    "core/ErrorHandler",                   // Hand graph errors to a function
    "core/Trigger",                        // Publish an event and run matching listeners
    "event/EmitStatus",                    // Publish a status message
    "core/functions/UnpackException",      // Error name and message
    "core/functions/Argument",             // Keyword argument of the running call
    "core/functions/Return",               // Result of the running call
    "core/functions/DefineFunction",       // Name a function graph
    "core/functions/GetFunction",          // Look up a named function graph
    "core/functions/CallFunction",         // Call a function once
    "core/functions/CallForEach",          // Call a function per list item
    "core/functions/Breakpoint",           // Pause until released
    "state/SetState",                      // Write a scoped variable
    "state/GetState",                      // Read a scoped variable
    "state/UnsetState",                    // Remove a scoped variable
    "state/HasState",                      // Check a scoped variable
    "state/CounterState",                  // Increment a scoped counter
    "focal/Focal",                         // Prompt, parse and dispatch calls
    "focal/Callback",                      // Expose a function to the model
    "focal/ProcessCall",                   // Unpack one call
    "agents/GetAgent",                     // Agent instance by type
    "ux/BuildChoiceElement",               // Choice element
    "ux/BuildTextInputElement",            // Text input element
    "ux/EmitElement",                      // Present an element and wait for the answer
];

/// Factory for a built-in node kind.
pub fn factory(name: &str) -> Option<fn() -> Node> {
    let factory: fn() -> Node = match name {
        // --- core ---
        "core/Input" => base::input,
        "core/Output" => base::output,
        "core/ModuleProperty" => base::module_property,
        "core/Route" => base::route,
        "core/Watch" => base::watch,
        "core/Stage" => base::stage,
        "core/Switch" => base::switch,
        "core/ORRouter" => base::or_router,
        "core/ANDRouter" => base::and_router,
        "core/Case" => base::case,
        "core/Coallesce" => base::coallesce,
        "core/MakeValue" => base::make_value,
        "core/MakeBool" => base::make_bool,
        "core/ApplyDefault" => base::apply_default,
        "core/Invert" => base::invert,
        "core/RunModule" => base::run_module,
        "core/LoopBreak" => base::loop_break,
        "core/LoopContinue" => base::loop_continue,
        "raise/Stop" => base::stop,
        "core/ErrorHandler" => base::error_handler,
        "core/Trigger" => base::trigger,
        "event/EmitStatus" => base::emit_status,
        "core/functions/UnpackException" => base::unpack_exception,

        // --- functions ---
        "core/functions/Argument" => function::argument,
        "core/functions/Return" => function::return_node,
        "core/functions/DefineFunction" => function::define_function,
        "core/functions/GetFunction" => function::get_function,
        "core/functions/CallFunction" => function::call_function,
        "core/functions/CallForEach" => function::call_for_each,
        "core/functions/Breakpoint" => function::breakpoint,

        // --- state ---
        "state/SetState" => state::set_state,
        "state/GetState" => state::get_state,
        "state/UnsetState" => state::unset_state,
        "state/HasState" => state::has_state,
        "state/CounterState" => state::counter_state,

        // --- focal ---
        "focal/Focal" => focal::focal,
        "focal/Callback" => focal::callback,
        "focal/ProcessCall" => focal::process_call,
        "agents/GetAgent" => focal::get_agent,

        // --- ux ---
        "ux/BuildChoiceElement" => ux::build_choice_element,
        "ux/BuildTextInputElement" => ux::build_text_input_element,
        "ux/EmitElement" => ux::emit_element,

        _ => return None,
    };
    Some(factory)
}

/// Register every entry of [`BUILTIN_NODES`] with `registry`.
pub fn register_builtins(registry: &Registry) -> Result<()> {
    for name in BUILTIN_NODES {
        if let Some(factory) = factory(name) {
            registry.register(name, factory)?;
        }
    }
    debug!(count = BUILTIN_NODES.len(), "built-in nodes registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_has_a_factory() {
        for name in BUILTIN_NODES {
            let node = factory(name).map(|f| f());
            assert_eq!(node.map(|n| n.registry), Some(name.to_string()), "{name}");
        }
        assert!(factory("core/Nope").is_none());
    }
}
