//! OpenAI-compatible chat completions backend (OpenRouter, OpenAI, local gateways)

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChunkStream, CompletionRequest, ModelBackend};
use crate::error::BackendError;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Buffered chunks between the HTTP reader task and the consumer
const STREAM_BUFFER: usize = 64;

pub struct OpenAiCompatBackend {
    client: Client,
    provider: String,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenAiCompatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatBackend")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "(unset)" } else { "***" })
            .finish()
    }
}

impl OpenAiCompatBackend {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            provider: provider.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model_id,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_message},
            ],
            "temperature": request.options.temperature,
            "max_tokens": request.options.max_tokens,
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    /// Send the request and map non-2xx statuses to backend errors
    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        if self.api_key.trim().is_empty() {
            return Err(BackendError::MissingCredentials);
        }

        debug!(
            "{} request: model={}, stream={}",
            self.provider, request.model_id, stream
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&Self::request_body(request, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::from_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let response = self.send(request, false).await?;
        let body: ChatCompletion = response.json().await?;
        extract_content(body)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, BackendError> {
        let response = self.send(request, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            if let Err(e) = pump_sse(response, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// Read the SSE body line by line and forward content deltas.
/// Returns early once the receiver is gone.
async fn pump_sse(
    response: reqwest::Response,
    tx: &mpsc::Sender<Result<String, BackendError>>,
) -> Result<(), BackendError> {
    let mut bytes = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.map_err(|e| BackendError::Stream(e.to_string()))?;
        buffer.extend_from_slice(&chunk);

        while let Some(line) = next_line(&mut buffer, false) {
            if !forward(&line, tx).await? {
                return Ok(());
            }
        }
    }

    // Body ended without a trailing newline
    if let Some(line) = next_line(&mut buffer, true) {
        forward(&line, tx).await?;
    }
    Ok(())
}

/// Take the next complete line off the buffer. At end of body the
/// unterminated remainder counts as a line.
pub(crate) fn next_line(buffer: &mut Vec<u8>, at_eof: bool) -> Option<String> {
    let end = match buffer.iter().position(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None if at_eof && !buffer.is_empty() => buffer.len(),
        None => return None,
    };
    let line: Vec<u8> = buffer.drain(..end).collect();
    Some(String::from_utf8_lossy(&line).into_owned())
}

/// Send one line's content on. `false` once the stream is over.
async fn forward(
    line: &str,
    tx: &mpsc::Sender<Result<String, BackendError>>,
) -> Result<bool, BackendError> {
    match parse_sse_line(line)? {
        SseLine::Skip => Ok(true),
        SseLine::Done => Ok(false),
        SseLine::Content(text) => {
            if tx.send(Ok(text)).await.is_err() {
                debug!("Stream consumer dropped, closing backend stream");
                return Ok(false);
            }
            Ok(true)
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Done,
    Content(String),
}

/// Interpret one SSE line of a streamed chat completion
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let parsed: StreamChunk = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("Ignoring unparseable SSE payload: {}", e);
            return Ok(SseLine::Skip);
        }
    };

    if let Some(err) = parsed.error {
        return Err(BackendError::Stream(err.message));
    }

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();

    if content.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Content(content))
    }
}

fn extract_content(body: ChatCompletion) -> Result<String, BackendError> {
    if let Some(err) = body.error {
        return Err(BackendError::Server {
            status: 200,
            message: err.message,
        });
    }
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Stream("response had no choices".into()))
}

// ── wire types ──

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
