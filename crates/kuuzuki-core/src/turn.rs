// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The turn loop: one user message in, one assistant message out, with any
//! number of model steps in between.  Each step is one streaming call to
//! the provider adapter; tool calls surfacing in the stream are executed
//! sequentially — resolve, validate (remediate), hook, permission, run —
//! and their results feed the next step.  The session lock guarantees a
//! single active turn; the cancellation token reaches the stream reader,
//! every tool and (through the gate) every pending permission prompt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kuuzuki_bus::Event;
use kuuzuki_id::{ascending, IdKind};
use kuuzuki_model::{
    is_retryable, CompletionRequest, EventStream, ModelMessage, StreamEvent, ToolSchema,
};
use kuuzuki_permission::AskRequest;
use kuuzuki_plugin::{ChatParams, ToolCallRef, ToolResultPayload};
use kuuzuki_tools::{validate_args, ResolvedVia, ToolContext};
use kuuzuki_types::{
    now_ms, FinishReason, MessageInfo, Part, PartBody, Role, SessionInfo, TimeRange, ToolState,
};

use crate::compact::{compact, needs_compaction};
use crate::context::{build_context, estimate_tokens, StoredMessage};
use crate::{prompts, title, App, CoreError};

/// One user submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInput {
    pub session_id: String,
    pub parts: Vec<InputPart>,
    /// `"<provider>/<model>"` override; falls back to mode, then config.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InputPart {
    Text {
        text: String,
    },
    File {
        mime: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        inline_data: Option<String>,
    },
}

/// Run one turn to completion.  Returns the assistant message, which may
/// carry an `error`/`finish` annotation instead of failing the call — only
/// `SessionBusy` and `SessionNotFound` surface as errors.
pub async fn run_turn(app: &Arc<App>, input: TurnInput) -> Result<MessageInfo, CoreError> {
    let session = app.sessions.get(&input.session_id).await?;
    let guard = app.sessions.begin_turn(&session.id)?;
    let cancel = guard.token();
    let result = drive_turn(app, &session, &input, cancel).await;
    drop(guard);
    result
}

async fn drive_turn(
    app: &Arc<App>,
    session: &SessionInfo,
    input: &TurnInput,
    cancel: CancellationToken,
) -> Result<MessageInfo, CoreError> {
    let mode = input.mode.as_deref();
    let agent = input.agent.as_deref();
    let provider = app.resolve_provider(input.model.as_deref(), agent, mode)?;

    let prior_user_messages = app
        .sessions
        .messages(&session.id)
        .await?
        .iter()
        .filter(|m| m.role == Role::User)
        .count();

    // ── User message ──────────────────────────────────────────────────────────
    let mut user = MessageInfo::new(ascending(IdKind::Message), &session.id, Role::User);
    user.mode = mode.map(str::to_string);
    app.sessions.write_message(&user).await?;

    let mut user_parts = Vec::with_capacity(input.parts.len());
    let mut user_text = String::new();
    for part in &input.parts {
        let body = match part {
            InputPart::Text { text } => {
                if !user_text.is_empty() {
                    user_text.push('\n');
                }
                user_text.push_str(text);
                PartBody::Text { text: text.clone() }
            }
            InputPart::File {
                mime,
                filename,
                url,
                inline_data,
            } => PartBody::File {
                mime: mime.clone(),
                filename: filename.clone(),
                url: url.clone(),
                inline_data: inline_data.clone(),
            },
        };
        let stored = Part::new(ascending(IdKind::Part), &session.id, &user.id, body);
        app.sessions.write_part(&stored).await?;
        user_parts.push(stored);
    }
    app.plugins.chat_message(&user, &user_parts).await;

    // First user message of the session kicks off title generation; the
    // turn never waits for it.
    if prior_user_messages == 0 && !user_text.is_empty() {
        title::spawn(
            Arc::clone(app),
            session.id.clone(),
            Arc::clone(&provider),
            user_text,
        );
    }

    // ── Tool set and sampling parameters ──────────────────────────────────────
    // Agent toggles override the mode's where both name a tool.
    let mut toggles = mode
        .and_then(|name| app.config.mode.get(name))
        .map(|m| m.tools.clone())
        .unwrap_or_default();
    if let Some(overrides) = agent.and_then(|name| app.config.agent.get(name)) {
        toggles.extend(overrides.tools.clone());
    }
    let tool_schemas: Vec<ToolSchema> = app
        .tools
        .schemas_for(&toggles)
        .into_iter()
        .map(|s| ToolSchema {
            name: s.name,
            description: s.description,
            parameters: s.parameters,
        })
        .collect();

    let mut params = ChatParams::default();
    app.plugins.chat_params(&mut params).await;

    // ── Assistant message ─────────────────────────────────────────────────────
    let mut assistant = MessageInfo::new(ascending(IdKind::Message), &session.id, Role::Assistant);
    assistant.provider_id = Some(provider.id().to_string());
    assistant.model_id = Some(provider.model().to_string());
    assistant.mode = mode.map(str::to_string);
    app.sessions.write_message(&assistant).await?;

    // ── Step loop ─────────────────────────────────────────────────────────────
    // Tool-call and tool-result messages accumulated across steps; the next
    // step's request replays them after the stored history.
    let mut extra: Vec<ModelMessage> = Vec::new();
    let max_retries = app.config.turn.max_retries;
    let system = prompts::system_prompts(&app.config, input.agent.as_deref(), mode);

    let mut steps = 0u32;
    loop {
        if steps >= app.config.turn.max_steps {
            warn!(session = %session.id, "step budget exhausted, ending turn");
            assistant.finish = Some(FinishReason::Stop);
            break;
        }
        steps += 1;

        if cancel.is_cancelled() {
            assistant.finish = Some(FinishReason::Interrupted);
            break;
        }

        let history = load_history(app, &session.id, &assistant.id).await?;
        let mut base = build_context(&system, &history, session.revert.as_ref());

        let estimate =
            estimate_tokens(&base) + estimate_tokens(&extra) + schema_tokens(&tool_schemas);
        if needs_compaction(estimate, provider.context_window(), &app.config.compaction) {
            match compact(app, &session.id, &provider).await {
                Ok(_) => {
                    let history = load_history(app, &session.id, &assistant.id).await?;
                    base = build_context(&system, &history, session.revert.as_ref());
                }
                Err(e) => {
                    warn!(session = %session.id, error = %e, "compaction failed, proceeding uncompacted")
                }
            }
        }

        let mut messages = base;
        messages.extend(extra.iter().cloned());
        let request = CompletionRequest {
            messages,
            tools: tool_schemas.clone(),
            temperature: params.temperature,
            top_p: params.top_p,
        };

        // Open the stream and consume it; transient provider failures
        // restart the stream with exponential backoff.
        let mut attempt = 0u32;
        let outcome = loop {
            let stream: EventStream = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StepOutcome::cancelled(),
                opened = provider.stream(request.clone()) => match opened {
                    Ok(stream) => stream,
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        attempt += 1;
                        warn!(session = %session.id, attempt, error = %e, "retrying model stream");
                        backoff(attempt).await;
                        continue;
                    }
                    Err(e) => break StepOutcome::failed(e),
                },
            };

            let out = consume_stream(
                app,
                &session.id,
                &mut assistant,
                stream,
                &mut extra,
                &cancel,
                input.agent.as_deref(),
            )
            .await?;

            // A mid-stream transient error restarts the step only while no
            // tool has executed; tool effects must not replay.
            let transient = matches!(&out.error, Some(e) if is_retryable(e))
                && attempt < max_retries
                && !out.made_tool_calls;
            if transient {
                attempt += 1;
                warn!(session = %session.id, attempt, "retrying model stream after mid-stream error");
                backoff(attempt).await;
                continue;
            }
            break out;
        };

        if outcome.cancelled {
            assistant.finish = Some(FinishReason::Interrupted);
            app.permissions.cancel_session(&session.id).await;
            break;
        }
        if let Some(e) = outcome.error {
            assistant.error = Some(e.to_string());
            assistant.finish = Some(FinishReason::Error);
            app.bus
                .publish(Event::SessionError {
                    session_id: Some(session.id.clone()),
                    error: e.to_string(),
                })
                .await;
            break;
        }
        if outcome.made_tool_calls || outcome.finish == Some(FinishReason::ToolCalls) {
            continue;
        }
        // Stream end without an explicit finish counts as interrupted.
        assistant.finish = Some(outcome.finish.unwrap_or(FinishReason::Interrupted));
        break;
    }

    app.sessions.write_message(&assistant).await?;
    Ok(assistant)
}

struct StepOutcome {
    finish: Option<FinishReason>,
    made_tool_calls: bool,
    error: Option<anyhow::Error>,
    cancelled: bool,
}

impl StepOutcome {
    fn cancelled() -> Self {
        Self {
            finish: None,
            made_tool_calls: false,
            error: None,
            cancelled: true,
        }
    }

    fn failed(e: anyhow::Error) -> Self {
        Self {
            finish: None,
            made_tool_calls: false,
            error: Some(e),
            cancelled: false,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume_stream(
    app: &Arc<App>,
    session_id: &str,
    assistant: &mut MessageInfo,
    mut stream: EventStream,
    extra: &mut Vec<ModelMessage>,
    cancel: &CancellationToken,
    agent: Option<&str>,
) -> Result<StepOutcome, CoreError> {
    let mut out = StepOutcome {
        finish: None,
        made_tool_calls: false,
        error: None,
        cancelled: false,
    };
    let mut current_text: Option<Part> = None;
    let mut current_reasoning: Option<Part> = None;
    let mut arg_buffers: HashMap<String, String> = HashMap::new();
    let mut tool_parts: HashMap<String, Part> = HashMap::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                out.cancelled = true;
                break;
            }
            event = stream.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                out.error = Some(e);
                break;
            }
        };

        match event {
            StreamEvent::TextDelta(delta) if !delta.is_empty() => {
                let part = current_text.get_or_insert_with(|| {
                    Part::new(
                        ascending(IdKind::Part),
                        session_id,
                        &assistant.id,
                        PartBody::Text {
                            text: String::new(),
                        },
                    )
                });
                if let PartBody::Text { text } = &mut part.body {
                    text.push_str(&delta);
                }
                app.sessions.write_part(part).await?;
            }
            StreamEvent::TextDelta(_) => {}
            StreamEvent::ReasoningDelta(delta) => {
                let part = current_reasoning.get_or_insert_with(|| {
                    Part::new(
                        ascending(IdKind::Part),
                        session_id,
                        &assistant.id,
                        PartBody::Reasoning {
                            text: String::new(),
                        },
                    )
                });
                if let PartBody::Reasoning { text } = &mut part.body {
                    text.push_str(&delta);
                }
                app.sessions.write_part(part).await?;
            }
            StreamEvent::ToolCallStart { call_id, name } => {
                let part = Part::new(
                    ascending(IdKind::Part),
                    session_id,
                    &assistant.id,
                    PartBody::Tool {
                        tool: name,
                        call_id: call_id.clone(),
                        state: ToolState::Pending,
                    },
                );
                app.sessions.write_part(&part).await?;
                tool_parts.insert(call_id, part);
            }
            StreamEvent::ToolCallDelta { call_id, arguments } => {
                arg_buffers.entry(call_id).or_default().push_str(&arguments);
            }
            StreamEvent::ToolCallReady {
                call_id,
                name,
                arguments,
            } => {
                // Close the running text/reasoning accumulation so part
                // ordering mirrors the stream.
                current_text = None;
                current_reasoning = None;

                let raw = if arguments.is_empty() {
                    arg_buffers.remove(&call_id).unwrap_or_default()
                } else {
                    arguments
                };
                let part = tool_parts.remove(&call_id).unwrap_or_else(|| {
                    // Some adapters emit ready without a start event.
                    Part::new(
                        ascending(IdKind::Part),
                        session_id,
                        &assistant.id,
                        PartBody::Tool {
                            tool: name.clone(),
                            call_id: call_id.clone(),
                            state: ToolState::Pending,
                        },
                    )
                });
                execute_tool_call(
                    app, session_id, assistant, part, &name, &call_id, raw, extra, cancel, agent,
                )
                .await?;
                out.made_tool_calls = true;
            }
            StreamEvent::StepStart => {
                let part = Part::new(
                    ascending(IdKind::Part),
                    session_id,
                    &assistant.id,
                    PartBody::StepStart,
                );
                app.sessions.write_part(&part).await?;
            }
            StreamEvent::StepFinish { tokens, cost } => {
                let part = Part::new(
                    ascending(IdKind::Part),
                    session_id,
                    &assistant.id,
                    PartBody::StepFinish { tokens, cost },
                );
                app.sessions.write_part(&part).await?;
                let mut total = assistant.tokens.unwrap_or_default();
                total.add(&tokens);
                assistant.tokens = Some(total);
                assistant.cost = Some(assistant.cost.unwrap_or(0.0) + cost);
                app.sessions.write_message(assistant).await?;
            }
            StreamEvent::Finish { reason } => {
                out.finish = Some(reason);
                break;
            }
        }
    }

    Ok(out)
}

/// The tool-execution procedure: resolve, validate (with remediation),
/// `tool.execute.before`, permission gate, run under the tool's timeout and
/// the session token, `tool.execute.after`, terminal part.
#[allow(clippy::too_many_arguments)]
async fn execute_tool_call(
    app: &Arc<App>,
    session_id: &str,
    assistant: &MessageInfo,
    mut part: Part,
    requested: &str,
    call_id: &str,
    raw_args: String,
    extra: &mut Vec<ModelMessage>,
    cancel: &CancellationToken,
    agent: Option<&str>,
) -> Result<(), CoreError> {
    let started = now_ms();
    let mut args = parse_tool_arguments(requested, call_id, &raw_args);

    let resolution = app.tools.resolve(session_id, requested);
    let tool = resolution.tool;
    debug!(
        requested,
        resolved = tool.name(),
        via = resolution.via.as_str(),
        "dispatching tool call"
    );
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        "resolved_via".to_string(),
        Value::String(resolution.via.as_str().to_string()),
    );

    set_tool_state(&mut part, ToolState::Running { input: args.clone() });
    app.sessions.write_part(&part).await?;

    // Parameter validation with known-tool remediation.  The fallback
    // executor has no real schema; it exists to produce the error part.
    if resolution.via != ResolvedVia::Fallback {
        let schema = tool.parameters_schema();
        if let Err(violation) = validate_args(&schema, &args) {
            let remediated = app.tools.remediate(tool.name(), &mut args);
            if remediated {
                annotations.insert("remediation_applied".to_string(), Value::Bool(true));
            }
            if !remediated || validate_args(&schema, &args).is_err() {
                return finish_error(
                    app,
                    &mut part,
                    args,
                    format!("Invalid arguments: {violation}"),
                    started,
                    call_id,
                    requested,
                    extra,
                )
                .await;
            }
        }
    }

    let call_ref = ToolCallRef {
        tool: tool.name().to_string(),
        call_id: call_id.to_string(),
        session_id: session_id.to_string(),
    };
    app.plugins.tool_execute_before(&call_ref, &mut args).await;

    if let Some(spec) = tool.permission(&args) {
        let ask = AskRequest {
            session_id: session_id.to_string(),
            message_id: assistant.id.clone(),
            call_id: Some(call_id.to_string()),
            kind: tool.name().to_string(),
            pattern: spec.pattern,
            title: spec.title,
            metadata: spec.metadata,
            agent: agent.map(str::to_string),
        };
        if let Err(rejected) = app.permissions.ask(ask).await {
            return finish_error(
                app,
                &mut part,
                args,
                rejected.message,
                started,
                call_id,
                requested,
                extra,
            )
            .await;
        }
    }

    let ctx = ToolContext {
        session_id: session_id.to_string(),
        message_id: assistant.id.clone(),
        call_id: call_id.to_string(),
        root: app.root.clone(),
        abort: cancel.clone(),
    };
    let execution = tool.execute(args.clone(), &ctx);
    let result = match tool.timeout() {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {}s", limit.as_secs())),
        },
        None => execution.await,
    };

    match result {
        Ok(result) => {
            let mut payload = ToolResultPayload {
                title: result.title,
                output: result.output,
                metadata: result.metadata,
            };
            app.plugins.tool_execute_after(&call_ref, &mut payload).await;

            let mut metadata = match payload.metadata {
                Value::Object(m) => m,
                _ => serde_json::Map::new(),
            };
            metadata.extend(annotations);

            set_tool_state(
                &mut part,
                ToolState::Completed {
                    input: args.clone(),
                    output: payload.output.clone(),
                    title: payload.title,
                    metadata: Value::Object(metadata),
                    time: TimeRange {
                        start: started,
                        end: now_ms(),
                    },
                },
            );
            app.sessions.write_part(&part).await?;

            extra.push(ModelMessage::tool_call(call_id, requested, args.to_string()));
            extra.push(ModelMessage::tool_result(call_id, payload.output));
            Ok(())
        }
        Err(e) => {
            finish_error(
                app,
                &mut part,
                args,
                e.to_string(),
                started,
                call_id,
                requested,
                extra,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_error(
    app: &Arc<App>,
    part: &mut Part,
    input: Value,
    error: String,
    started: i64,
    call_id: &str,
    requested: &str,
    extra: &mut Vec<ModelMessage>,
) -> Result<(), CoreError> {
    set_tool_state(
        part,
        ToolState::Error {
            input: input.clone(),
            error: error.clone(),
            time: TimeRange {
                start: started,
                end: now_ms(),
            },
        },
    );
    app.sessions.write_part(part).await?;
    extra.push(ModelMessage::tool_call(call_id, requested, input.to_string()));
    extra.push(ModelMessage::tool_result(call_id, format!("Error: {error}")));
    Ok(())
}

/// Forward-only state update; a violating transition is dropped with a
/// warning rather than corrupting the part.
fn set_tool_state(part: &mut Part, next: ToolState) {
    if let PartBody::Tool { state, .. } = &mut part.body {
        if state.allows(&next) {
            *state = next;
        } else {
            warn!(part = %part.id, "dropping backward tool-state transition");
        }
    }
}

async fn load_history(
    app: &Arc<App>,
    session_id: &str,
    exclude_message: &str,
) -> Result<Vec<StoredMessage>, CoreError> {
    let mut history = Vec::new();
    for info in app.sessions.messages(session_id).await? {
        if info.id == exclude_message {
            continue;
        }
        let parts = app.sessions.parts(session_id, &info.id).await?;
        history.push((info, parts));
    }
    Ok(history)
}

fn schema_tokens(schemas: &[ToolSchema]) -> usize {
    schemas
        .iter()
        .map(|s| (s.name.len() + s.description.len() + s.parameters.to_string().len()) / 4)
        .sum()
}

async fn backoff(attempt: u32) {
    let millis = 250u64.saturating_mul(1 << (attempt - 1).min(8));
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

// ── Argument parsing ──────────────────────────────────────────────────────────

/// Parse the accumulated argument JSON, repairing common model mistakes.
/// Anything unrecoverable becomes `{}` so the tool's own validation reports
/// a readable error instead of the turn crashing.
fn parse_tool_arguments(tool: &str, call_id: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        warn!(tool, call_id, "tool call with empty arguments; substituting {{}}");
        return Value::Object(Default::default());
    }
    if let Ok(Value::Object(map)) = serde_json::from_str(raw) {
        return Value::Object(map);
    }
    match attempt_json_repair(raw) {
        Some(Value::Object(map)) => {
            warn!(tool, call_id, "repaired invalid JSON arguments from model");
            Value::Object(map)
        }
        _ => {
            warn!(tool, call_id, "unparseable tool arguments; substituting {{}}");
            Value::Object(Default::default())
        }
    }
}

/// Attempt to repair common JSON syntax errors: invalid escape sequences
/// inside strings, and truncated output missing its closing quote/brace.
fn attempt_json_repair(raw: &str) -> Option<Value> {
    let fixed = fix_invalid_json_escapes(raw);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }

    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        if completed.chars().filter(|&c| c == '"').count() % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }

    None
}

/// Replace invalid escape sequences inside string values with an escaped
/// backslash.  Valid JSON escapes are `"` `\` `/` `b` `f` `n` `r` `t` `u`;
/// models occasionally emit things like `\c` or `\(`.
fn fix_invalid_json_escapes(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len() + 16);
    let mut chars = raw.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
