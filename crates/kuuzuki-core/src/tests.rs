// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! End-to-end turn-loop tests against the scripted mock provider: tool
//! dispatch, permission gating and memoization, resolver fallbacks,
//! remediation, retry, compaction, revert and cancellation.

use std::sync::Arc;
use std::time::Duration;

use kuuzuki_bus::{Bus, Envelope, Event};
use kuuzuki_config::Config;
use kuuzuki_id::{ascending, IdKind};
use kuuzuki_model::mock::{text_turn, tool_call_turn, Script, ScriptedProvider};
use kuuzuki_model::ProviderRegistry;
use kuuzuki_permission::PermissionGate;
use kuuzuki_plugin::PluginHost;
use kuuzuki_storage::Storage;
use kuuzuki_types::{
    FinishReason, MessageInfo, Part, PartBody, PermissionReply, Role, ToolState,
};

use crate::{run_turn, App, CoreError, InputPart, TurnInput};

struct Harness {
    _dir: tempfile::TempDir,
    app: Arc<App>,
    provider: Arc<ScriptedProvider>,
}

fn harness(scripts: Vec<Script>, permission: Option<&str>) -> Harness {
    harness_full(scripts, None, permission, 128_000)
}

fn harness_full(
    scripts: Vec<Script>,
    env_permission: Option<&str>,
    permission: Option<&str>,
    context_window: usize,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::new();
    let storage =
        Arc::new(Storage::open(dir.path().join("data"), Arc::clone(&bus)).unwrap());

    let provider = Arc::new(ScriptedProvider::new(scripts).with_context_window(context_window));
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::clone(&provider) as Arc<dyn kuuzuki_model::Provider>);

    let mut config = Config::default();
    config.model = Some("mock/scripted".into());

    let plugins = PluginHost::new(Vec::new());
    let gate = PermissionGate::new(
        Arc::clone(&bus),
        Arc::clone(&plugins),
        env_permission.map(|j| serde_json::from_str(j).unwrap()),
        permission.map(|j| serde_json::from_str(j).unwrap()),
    )
    .with_timeout(Duration::from_millis(300));

    let app = App::assemble(
        bus,
        storage,
        Arc::new(config),
        Arc::new(providers),
        kuuzuki_tools::builtin_registry(),
        gate,
        plugins,
        None,
        dir.path().to_path_buf(),
    )
    .unwrap();

    Harness {
        _dir: dir,
        app,
        provider,
    }
}

/// Seed one stored message so the turn under test is not the session's
/// first user message (which would dispatch title generation and consume a
/// script non-deterministically).
async fn seed_message(app: &Arc<App>, session_id: &str, role: Role, text: &str) -> MessageInfo {
    let info = MessageInfo::new(ascending(IdKind::Message), session_id, role);
    app.sessions.write_message(&info).await.unwrap();
    let part = Part::new(
        ascending(IdKind::Part),
        session_id,
        &info.id,
        PartBody::Text { text: text.into() },
    );
    app.sessions.write_part(&part).await.unwrap();
    info
}

async fn seeded_session(h: &Harness) -> String {
    let session = h.app.sessions.create(None).await.unwrap();
    seed_message(&h.app, &session.id, Role::User, "earlier question").await;
    seed_message(&h.app, &session.id, Role::Assistant, "earlier answer").await;
    session.id
}

fn text_input(session_id: &str, text: &str) -> TurnInput {
    TurnInput {
        session_id: session_id.into(),
        parts: vec![InputPart::Text { text: text.into() }],
        model: None,
        mode: None,
        agent: None,
    }
}

async fn assistant_parts(h: &Harness, session_id: &str, message_id: &str) -> Vec<Part> {
    h.app.sessions.parts(session_id, message_id).await.unwrap()
}

fn tool_states(parts: &[Part]) -> Vec<&ToolState> {
    parts.iter().filter_map(Part::tool_state).collect()
}

/// Answer the next permission prompt on the bus with `reply`.
fn auto_respond(app: &Arc<App>, reply: PermissionReply) {
    let gate = Arc::clone(&app.permissions);
    let mut tap = app.bus.tap();
    tokio::spawn(async move {
        while let Ok(env) = tap.recv().await {
            if let Event::PermissionUpdated { info } = env.event {
                gate.respond(&info.session_id, &info.id, reply).await;
                break;
            }
        }
    });
}

// ── Plain turns ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_turn_completes_and_persists_parts() {
    let h = harness(vec![Script::Events(text_turn("hello there"))], None);
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "hi")).await.unwrap();

    assert_eq!(assistant.finish, Some(FinishReason::Stop));
    assert!(assistant.error.is_none());
    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    let text: Vec<&str> = parts.iter().filter_map(Part::as_text).collect();
    assert_eq!(text, ["hello there"]);
    assert!(assistant.tokens.is_some());
    assert!(assistant.cost.is_some());
}

#[tokio::test]
async fn turn_on_unknown_session_fails() {
    let h = harness(vec![], None);
    let err = run_turn(&h.app, text_input("session_missing", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionNotFound(_)));
}

#[tokio::test]
async fn concurrent_turn_on_same_session_is_busy() {
    let h = harness(vec![Script::Events(text_turn("x"))], None);
    let sid = seeded_session(&h).await;

    let _guard = h.app.sessions.begin_turn(&sid).unwrap();
    let err = run_turn(&h.app, text_input(&sid, "hi")).await.unwrap_err();
    assert!(matches!(err, CoreError::SessionBusy(_)));
}

#[tokio::test]
async fn message_updated_precedes_its_part_updates() {
    let h = harness(vec![Script::Events(text_turn("ordered"))], None);
    let sid = seeded_session(&h).await;
    let mut tap = h.app.bus.tap();

    let assistant = run_turn(&h.app, text_input(&sid, "hi")).await.unwrap();

    let mut events: Vec<Envelope> = Vec::new();
    while let Ok(env) = tap.try_recv() {
        events.push(env);
    }
    let first_message = events.iter().position(|e| {
        matches!(&e.event, Event::MessageUpdated { info } if info.id == assistant.id)
    });
    let first_part = events.iter().position(|e| {
        matches!(&e.event, Event::PartUpdated { part } if part.message_id == assistant.id)
    });
    assert!(first_message.unwrap() < first_part.unwrap());
}

// ── Tool dispatch ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_call_executes_and_feeds_the_next_step() {
    let h = harness(
        vec![
            Script::Events(tool_call_turn(
                "call_1",
                "bash",
                r#"{"command": "echo from-tool"}"#,
            )),
            Script::Events(text_turn("saw the output")),
        ],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "run it")).await.unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Stop));

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    let states = tool_states(&parts);
    assert_eq!(states.len(), 1);
    match states[0] {
        ToolState::Completed {
            output, metadata, ..
        } => {
            assert!(output.contains("from-tool"));
            assert_eq!(metadata["resolved_via"], "direct");
        }
        other => panic!("expected completed tool, got {other:?}"),
    }

    // The second request replays the tool call and its result.
    let requests = h.provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let replayed = &requests[1].messages;
    assert!(replayed.iter().any(|m| matches!(
        &m.content,
        kuuzuki_model::ModelContent::ToolResult { content, .. } if content.contains("from-tool")
    )));
}

#[tokio::test]
async fn composite_resolution_runs_the_tool_and_records_the_strategy() {
    // The registry holds `file_read`; the model asks for `read_file`.
    let h = harness(
        vec![
            Script::Events(tool_call_turn(
                "call_1",
                "read_file",
                r#"{"path": "composite.txt"}"#,
            )),
            Script::Events(text_turn("read it")),
        ],
        None,
    );
    std::fs::write(h._dir.path().join("composite.txt"), "payload\n").unwrap();
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "read the file")).await.unwrap();

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Completed {
            output, metadata, ..
        } => {
            assert!(output.contains("payload"));
            assert_eq!(metadata["resolved_via"], "composite");
        }
        other => panic!("expected completed tool, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_falls_back_to_a_structured_error() {
    let h = harness(
        vec![
            Script::Events(tool_call_turn("call_1", "mystery_gadget", "{}")),
            Script::Events(text_turn("understood")),
        ],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "try it")).await.unwrap();
    // The turn continues; the model sees the error and answers.
    assert_eq!(assistant.finish, Some(FinishReason::Stop));

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => {
            assert!(error.contains("Unknown tool: mystery_gadget"));
        }
        other => panic!("expected error tool state, got {other:?}"),
    }
}

#[tokio::test]
async fn todo_priority_remediation_substitutes_and_marks_metadata() {
    let h = harness(
        vec![
            Script::Events(tool_call_turn(
                "call_1",
                "todo_write",
                r#"{"todos": [{"id": "1", "content": "fix", "status": "pending", "priority": "urgent"}]}"#,
            )),
            Script::Events(text_turn("noted")),
        ],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "track it")).await.unwrap();

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Completed {
            input, metadata, ..
        } => {
            assert_eq!(metadata["remediation_applied"], true);
            assert_eq!(input["todos"][0]["priority"], "medium");
        }
        other => panic!("expected completed tool, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_arguments_without_remediation_produce_an_error_part() {
    let h = harness(
        vec![
            // bash requires `command`.
            Script::Events(tool_call_turn("call_1", "bash", r#"{"wrong": 1}"#)),
            Script::Events(text_turn("ok")),
        ],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "go")).await.unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Stop));

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => assert!(error.contains("Invalid arguments")),
        other => panic!("expected error state, got {other:?}"),
    }
}

// ── Permission integration ────────────────────────────────────────────────────

#[tokio::test]
async fn allow_always_caches_across_turns() {
    // Config asks for every `echo *` bash command.  Turn 1 answers
    // "always"; turn 2 must run without any prompt.
    let h = harness(
        vec![
            Script::Events(tool_call_turn("call_1", "bash", r#"{"command": "echo one"}"#)),
            Script::Events(text_turn("first done")),
            Script::Events(tool_call_turn("call_2", "bash", r#"{"command": "echo two"}"#)),
            Script::Events(text_turn("second done")),
        ],
        Some(r#"{"bash": {"echo *": "ask"}}"#),
    );
    let sid = seeded_session(&h).await;

    auto_respond(&h.app, PermissionReply::Always);
    let first = run_turn(&h.app, text_input(&sid, "run one")).await.unwrap();
    let parts = assistant_parts(&h, &sid, &first.id).await;
    assert!(matches!(tool_states(&parts)[0], ToolState::Completed { .. }));

    // No responder for the second turn: a prompt would time out and fail.
    let second = run_turn(&h.app, text_input(&sid, "run two")).await.unwrap();
    let parts = assistant_parts(&h, &sid, &second.id).await;
    match tool_states(&parts)[0] {
        ToolState::Completed { output, .. } => assert!(output.contains("two")),
        other => panic!("expected completed tool, got {other:?}"),
    }
    assert_eq!(h.app.permissions.pending_count(), 0);
}

#[tokio::test]
async fn env_permission_overrides_config_allow() {
    let h = harness_full(
        vec![
            Script::Events(tool_call_turn("call_1", "bash", r#"{"command": "echo hi"}"#)),
            Script::Events(text_turn("done")),
        ],
        Some(r#"{"bash": "deny"}"#),
        Some(r#"{"bash": "allow"}"#),
        128_000,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "go")).await.unwrap();

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => {
            assert_eq!(error, "Permission denied by configuration");
        }
        other => panic!("expected denied tool, got {other:?}"),
    }
    // The turn continued past the denial.
    assert_eq!(assistant.finish, Some(FinishReason::Stop));
}

#[tokio::test]
async fn rejected_permission_becomes_an_error_part_and_turn_continues() {
    let h = harness(
        vec![
            Script::Events(tool_call_turn("call_1", "bash", r#"{"command": "rm -rf /"}"#)),
            Script::Events(text_turn("will not do that then")),
        ],
        Some(r#"{"bash": "ask"}"#),
    );
    let sid = seeded_session(&h).await;

    auto_respond(&h.app, PermissionReply::Reject);
    let assistant = run_turn(&h.app, text_input(&sid, "destroy")).await.unwrap();

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => assert!(error.contains("Permission denied")),
        other => panic!("expected error state, got {other:?}"),
    }
    assert_eq!(assistant.finish, Some(FinishReason::Stop));
}

#[tokio::test]
async fn unanswered_permission_times_out_and_turn_continues() {
    let h = harness(
        vec![
            Script::Events(tool_call_turn("call_1", "bash", r#"{"command": "echo hi"}"#)),
            Script::Events(text_turn("moving on")),
        ],
        Some(r#"{"bash": "ask"}"#),
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "go")).await.unwrap();

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => assert!(error.contains("timed out")),
        other => panic!("expected error state, got {other:?}"),
    }
    assert_eq!(h.app.permissions.pending_count(), 0);
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_tool_interrupts_and_releases_the_lock() {
    let h = harness(
        vec![Script::Events(tool_call_turn(
            "call_1",
            "bash",
            r#"{"command": "sleep 30"}"#,
        ))],
        None,
    );
    let sid = seeded_session(&h).await;
    let mut tap = h.app.bus.tap();

    let app = Arc::clone(&h.app);
    let sid2 = sid.clone();
    let turn = tokio::spawn(async move { run_turn(&app, text_input(&sid2, "hang")).await });

    // Wait until the tool part reports running, then cancel.
    loop {
        let env = tap.recv().await.unwrap();
        if let Event::PartUpdated { part } = &env.event {
            if matches!(part.tool_state(), Some(ToolState::Running { .. })) {
                break;
            }
        }
    }
    assert!(h.app.cancel(&sid).await);

    let assistant = turn.await.unwrap().unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Interrupted));

    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    match tool_states(&parts)[0] {
        ToolState::Error { error, .. } => assert_eq!(error, "cancelled"),
        other => panic!("expected cancelled tool, got {other:?}"),
    }
    assert_eq!(h.app.permissions.pending_count(), 0);
    // The lock is free again.
    let _guard = h.app.sessions.begin_turn(&sid).unwrap();
}

// ── Provider errors and retry ─────────────────────────────────────────────────

#[tokio::test]
async fn retryable_open_error_restarts_the_stream() {
    let h = harness(
        vec![
            Script::OpenError("HTTP 503 service unavailable".into()),
            Script::Events(text_turn("recovered")),
        ],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "hi")).await.unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Stop));
    assert!(assistant.error.is_none());
    let parts = assistant_parts(&h, &sid, &assistant.id).await;
    assert!(parts.iter().any(|p| p.as_text() == Some("recovered")));
}

#[tokio::test]
async fn non_retryable_error_marks_the_message_errored() {
    let h = harness(
        vec![Script::OpenError("invalid api key (401)".into())],
        None,
    );
    let sid = seeded_session(&h).await;

    let assistant = run_turn(&h.app, text_input(&sid, "hi")).await.unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Error));
    assert!(assistant.error.as_deref().unwrap().contains("401"));
}

// ── Compaction ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_context_triggers_compaction_and_turn_proceeds() {
    let h = harness_full(
        vec![
            // First stream call is the compaction summary.
            Script::Events(text_turn("SUMMARY-OF-THE-PAST")),
            Script::Events(text_turn("answered after compaction")),
        ],
        None,
        None,
        600,
    );
    let session = h.app.sessions.create(None).await.unwrap();
    let sid = session.id.clone();
    // Enough long history to blow the 600-token window (threshold 0.85,
    // headroom 0.10) while leaving messages beyond keep_recent.
    for i in 0..10 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        seed_message(&h.app, &sid, role, &"x".repeat(400)).await;
    }

    let assistant = run_turn(&h.app, text_input(&sid, "continue")).await.unwrap();
    assert_eq!(assistant.finish, Some(FinishReason::Stop));

    let messages = h.app.sessions.messages(&sid).await.unwrap();
    let summaries: Vec<&MessageInfo> = messages.iter().filter(|m| m.summary).collect();
    assert_eq!(summaries.len(), 1);

    // The model call after compaction starts from the summary floor.
    let requests = h.provider.requests.lock().unwrap();
    let last = &requests.last().unwrap().messages;
    assert!(last
        .iter()
        .any(|m| m.as_text() == Some("SUMMARY-OF-THE-PAST")));
}

// ── Revert ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn revert_hides_messages_and_unrevert_restores_them() {
    let h = harness(
        vec![
            Script::Events(text_turn("while reverted")),
            Script::Events(text_turn("after unrevert")),
        ],
        None,
    );
    let session = h.app.sessions.create(None).await.unwrap();
    let sid = session.id.clone();
    seed_message(&h.app, &sid, Role::User, "keep this").await;
    let hidden = seed_message(&h.app, &sid, Role::Assistant, "SECRET-LATER-MESSAGE").await;

    h.app
        .sessions
        .revert(
            &sid,
            kuuzuki_types::RevertAnchor {
                message_id: hidden.id.clone(),
                part_id: None,
            },
        )
        .await
        .unwrap();

    run_turn(&h.app, text_input(&sid, "what do you see?")).await.unwrap();
    {
        let requests = h.provider.requests.lock().unwrap();
        let seen = &requests[0].messages;
        assert!(!seen
            .iter()
            .any(|m| m.as_text() == Some("SECRET-LATER-MESSAGE")));
    }

    h.app.sessions.unrevert(&sid).await.unwrap();
    run_turn(&h.app, text_input(&sid, "and now?")).await.unwrap();
    let requests = h.provider.requests.lock().unwrap();
    let seen = &requests.last().unwrap().messages;
    assert!(seen
        .iter()
        .any(|m| m.as_text() == Some("SECRET-LATER-MESSAGE")));
}

// ── Title generation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn first_user_message_generates_a_title() {
    // The turn stream and the title call race for the two scripts; both
    // produce the same text so either interleaving yields the same title.
    let h = harness(
        vec![
            Script::Events(text_turn("Parser cleanup")),
            Script::Events(text_turn("Parser cleanup")),
        ],
        None,
    );
    let session = h.app.sessions.create(None).await.unwrap();

    run_turn(&h.app, text_input(&session.id, "clean up the parser"))
        .await
        .unwrap();

    // Title generation is asynchronous; poll briefly.
    let mut title = String::new();
    for _ in 0..50 {
        title = h.app.sessions.get(&session.id).await.unwrap().title;
        if title != "Untitled" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(title, "Parser cleanup");
}

#[tokio::test]
async fn later_turns_do_not_touch_the_title() {
    let h = harness(vec![Script::Events(text_turn("reply"))], None);
    let sid = seeded_session(&h).await;
    h.app
        .sessions
        .update(&sid, |info| info.title = "Existing title".into())
        .await
        .unwrap();

    run_turn(&h.app, text_input(&sid, "another question")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.app.sessions.get(&sid).await.unwrap().title,
        "Existing title"
    );
    // Only the turn's own script was consumed.
    assert_eq!(h.provider.remaining(), 0);
}
