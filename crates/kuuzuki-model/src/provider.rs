// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// The abstracted model provider the engine talks to.  Wire clients live
/// outside the core; the engine only consumes this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier, e.g. `"anthropic"`.
    fn id(&self) -> &str;

    /// Model identifier as reported to users.
    fn model(&self) -> &str;

    /// Input context window in tokens.  Drives the compaction trigger.
    fn context_window(&self) -> usize {
        128_000
    }

    /// Open one streaming completion call.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;
}

/// A `"<provider>/<model>"` reference as written in config and API requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl std::str::FromStr for ModelRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The model id may itself contain '/', so split on the first one only.
        let (provider_id, model_id) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("model reference must be <provider>/<model>: {s:?}"))?;
        if provider_id.is_empty() || model_id.is_empty() {
            anyhow::bail!("model reference must be <provider>/<model>: {s:?}");
        }
        Ok(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Registered provider adapters, looked up by `<provider>/<model>`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let key = format!("{}/{}", provider.id(), provider.model());
        self.providers.insert(key, provider);
    }

    pub fn get(&self, reference: &ModelRef) -> Option<Arc<dyn Provider>> {
        self.providers.get(&reference.to_string()).cloned()
    }

    pub fn resolve(&self, reference: &str) -> anyhow::Result<Arc<dyn Provider>> {
        let parsed: ModelRef = reference.parse()?;
        self.get(&parsed)
            .ok_or_else(|| anyhow::anyhow!("no provider registered for {reference:?}"))
    }

    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.providers.keys().cloned().collect();
        refs.sort();
        refs
    }
}

/// Heuristic retryability classification for provider errors.
///
/// The adapter boundary is string-typed (`anyhow`), so the turn loop decides
/// whether to restart the stream by matching the well-known transient
/// markers: rate limits, 5xx, timeouts and dropped connections.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    const MARKERS: &[&str] = &[
        "429",
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "rate limit",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
    ];
    MARKERS.iter().any(|m| msg.contains(m))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
