// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use kuuzuki_types::FinishReason;

use crate::{CompletionRequest, EventStream, ModelRole, Provider, StreamEvent};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.  Registered by the binary so the engine can be driven
/// end-to-end without a wire client.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn id(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "echo"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ModelRole::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::StepStart),
            Ok(StreamEvent::TextDelta(format!("ECHO: {reply}"))),
            Ok(StreamEvent::StepFinish {
                tokens: kuuzuki_types::TokenUsage {
                    input: 10,
                    output: 10,
                    ..Default::default()
                },
                cost: 0.0,
            }),
            Ok(StreamEvent::Finish {
                reason: FinishReason::Stop,
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted stream: either a sequence of events or an error raised when
/// the stream is opened (exercises the retry path).
pub enum Script {
    Events(Vec<StreamEvent>),
    OpenError(String),
}

/// A pre-scripted provider.  Each `stream` call pops the next script from
/// the front of the queue, so tests can specify exact event sequences —
/// including tool calls and transient failures — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Script>>,
    context_window: usize,
    /// Every `CompletionRequest` seen by this provider, in call order.
    /// Tests inspect this to assert on the assembled context.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            context_window: 128_000,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shrink the claimed context window so tests can force compaction.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Convenience: provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::Events(text_turn(reply))])
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

/// Build the canonical event sequence for a plain text step.
pub fn text_turn(reply: impl Into<String>) -> Vec<StreamEvent> {
    vec![
        StreamEvent::StepStart,
        StreamEvent::TextDelta(reply.into()),
        StreamEvent::StepFinish {
            tokens: kuuzuki_types::TokenUsage {
                input: 10,
                output: 5,
                ..Default::default()
            },
            cost: 0.001,
        },
        StreamEvent::Finish {
            reason: FinishReason::Stop,
        },
    ]
}

/// Build the canonical event sequence for a step that requests one tool call.
pub fn tool_call_turn(call_id: &str, name: &str, arguments: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::StepStart,
        StreamEvent::ToolCallStart {
            call_id: call_id.into(),
            name: name.into(),
        },
        StreamEvent::ToolCallDelta {
            call_id: call_id.into(),
            arguments: arguments.into(),
        },
        StreamEvent::ToolCallReady {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        },
        StreamEvent::StepFinish {
            tokens: kuuzuki_types::TokenUsage {
                input: 10,
                output: 5,
                ..Default::default()
            },
            cost: 0.001,
        },
        StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
        },
    ]
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "scripted"
    }
    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::Events(text_turn("[script exhausted]"))
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::OpenError(msg) => Err(anyhow::anyhow!(msg)),
            Script::Events(events) => {
                let items: Vec<anyhow::Result<StreamEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
