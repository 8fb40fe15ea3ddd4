//! Partial tool-call assembly for streaming LLM responses
//!
//! OpenAI-compatible streams deliver tool calls as fragments keyed by an
//! `index` field: the `id` and `function.name` usually arrive on the first
//! fragment, argument text dribbles in afterwards. Fragments for one call
//! may arrive in any order within that call, but indices are never reused
//! across calls in the same response.

use std::collections::BTreeMap;

use crate::llm::{StreamEvent, ToolCall};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
    announced: bool,
}

/// Reduces streamed tool-call fragments (keyed by index) into complete calls
#[derive(Debug, Default)]
pub struct ToolCallReducer {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment and return the stream events it stabilizes
    ///
    /// A `ToolCallStart` is emitted exactly once per call, as soon as both
    /// the id and a non-empty name are known. Argument deltas that arrive
    /// before the call is announced are buffered and replayed with the
    /// start event.
    pub fn apply(
        &mut self,
        index: usize,
        id: Option<&str>,
        name_fragment: Option<&str>,
        arguments_fragment: Option<&str>,
    ) -> Vec<StreamEvent> {
        let call = self.calls.entry(index).or_default();

        if let Some(id) = id {
            if call.id.is_none() {
                call.id = Some(id.to_string());
            }
        }
        if let Some(name) = name_fragment {
            call.name.push_str(name);
        }

        let mut events = Vec::new();

        if !call.announced {
            if let (Some(id), false) = (call.id.clone(), call.name.is_empty()) {
                call.announced = true;
                events.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: call.name.clone(),
                });
                // Replay arguments buffered before the name stabilized
                if !call.arguments.is_empty() {
                    events.push(StreamEvent::ToolCallDelta {
                        id,
                        arguments_delta: call.arguments.clone(),
                    });
                }
            }
        }

        if let Some(args) = arguments_fragment {
            if !args.is_empty() {
                call.arguments.push_str(args);
                if call.announced {
                    events.push(StreamEvent::ToolCallDelta {
                        id: call.id.clone().unwrap_or_default(),
                        arguments_delta: args.to_string(),
                    });
                }
            }
        }

        events
    }

    /// True once at least one call has a stable (non-empty) name
    pub fn has_stable_call(&self) -> bool {
        self.calls.values().any(|c| !c.name.is_empty())
    }

    /// Number of calls observed so far
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// `ToolCallComplete` events for every announced call, in index order
    pub fn completion_events(&self) -> Vec<StreamEvent> {
        self.calls
            .values()
            .filter(|c| c.announced)
            .map(|c| StreamEvent::ToolCallComplete {
                id: c.id.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Consume the reducer and return complete calls in index order
    ///
    /// Calls whose id never arrived get a synthesized one; calls with no
    /// name at all are dropped (the stream never stabilized them).
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = if c.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                };
                match c.id {
                    Some(id) => ToolCall {
                        id,
                        name: c.name,
                        arguments,
                    },
                    None => ToolCall::synthetic(c.name, arguments),
                }
            })
            .collect()
    }
}
