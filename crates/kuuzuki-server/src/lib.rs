// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Local HTTP boundary.  Sessions and turns are plain JSON endpoints; bus
//! envelopes are projected over a server-sent-events stream whose event ids
//! equal the envelope ids, so reconnecting observers can dedupe.  The bound
//! address is published through an atomically-replaced `server-info` file in
//! the data directory — that is how local UI processes discover a server
//! started on port 0.

mod info;
mod routes;

pub use info::ServerInfo;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use kuuzuki_core::App;

/// Bind `host:port` (port 0 picks a free port), write the discovery file
/// and serve until the process ends.
pub async fn serve(app: Arc<App>, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    let addr = listener.local_addr().context("reading bound address")?;

    let server_info = ServerInfo::current(host, addr.port());
    server_info
        .write(app.storage.root())
        .context("writing server-info")?;
    info!(%addr, "kuuzuki server listening");

    axum::serve(listener, routes::router(app))
        .await
        .context("serving")?;
    Ok(())
}

/// Test/embedder variant: bind and return the bound port plus the serve
/// future instead of blocking.
pub async fn bind(
    app: Arc<App>,
    host: &str,
    port: u16,
) -> anyhow::Result<(u16, impl std::future::Future<Output = std::io::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    let addr = listener.local_addr().context("reading bound address")?;
    let server_info = ServerInfo::current(host, addr.port());
    server_info
        .write(app.storage.root())
        .context("writing server-info")?;
    Ok((addr.port(), axum::serve(listener, routes::router(app)).into_future()))
}
