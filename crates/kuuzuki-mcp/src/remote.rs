// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::wire::{Request, Response};

/// A remote tool server reached over streaming HTTP.
///
/// Each JSON-RPC request is one POST.  Servers answer either with a plain
/// `application/json` body or with `text/event-stream`; in the latter case
/// the SSE `data:` payloads are scanned for the response matching our
/// request id.
pub struct RemoteServer {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    next_id: AtomicU64,
}

impl RemoteServer {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            headers,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = Request::new(id, method, params);

        let mut req = self
            .client
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(&body);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }

        let response = req.send().await.context("sending request")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tool server returned HTTP {status}");
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let parsed = if content_type.starts_with("text/event-stream") {
            debug!(method, "reading SSE response");
            self.read_sse_response(response, id).await?
        } else {
            response
                .json::<Response>()
                .await
                .context("parsing response body")?
        };

        if let Some(err) = parsed.error {
            anyhow::bail!("tool server error {}: {}", err.code, err.message);
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Scan an event-stream body for the response with our request id.
    async fn read_sse_response(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> anyhow::Result<Response> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading event stream")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<Response>(data.trim()) else {
                    continue;
                };
                if parsed.id == Some(id) {
                    return Ok(parsed);
                }
            }
        }
        anyhow::bail!("event stream ended before a response arrived")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// One-shot HTTP server returning a fixed body on the first request.
    async fn serve_once(status_line: &str, content_type: &str, body: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "{status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn plain_json_response_roundtrips() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            "application/json",
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#,
        )
        .await;
        let server = RemoteServer::new(url, HashMap::new());
        let result = server.request("tools/list", Value::Null).await.unwrap();
        assert_eq!(result["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn sse_response_is_scanned_for_matching_id() {
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{}}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n",
            "\n",
        );
        let url = serve_once("HTTP/1.1 200 OK", "text/event-stream", body).await;
        let server = RemoteServer::new(url, HashMap::new());
        let result = server.request("tools/call", Value::Null).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error", "text/plain", "boom").await;
        let server = RemoteServer::new(url, HashMap::new());
        let err = server.request("tools/list", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn rpc_error_payload_fails() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            "application/json",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nope"}}"#,
        )
        .await;
        let server = RemoteServer::new(url, HashMap::new());
        let err = server.request("tools/list", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
