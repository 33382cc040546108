//! Adapter for OpenAI-compatible (vLLM) inference servers.
//!
//! The text backend is called through `/v1/completions`, the audio backend
//! through streaming `/v1/chat/completions`. Both are probed with a one-token
//! completion for health checks.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use base64::Engine;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::{BackendHealth, FraudClassifier, FragmentStream, HealthReport};
use crate::config::{AppConfig, BackendConfig};
use crate::error::{AppError, UpstreamError};
use crate::formats::{log_preview, parse_audio_label, parse_text_label, AudioLabel, TextLabel};

const TEXT_PROMPT_PREFIX: &str = "Berdasarkan percakapan 2 orang melalui telepon berikut, klasifikasikan label yang 1 untuk percakapan biasa dan 2 untuk penipuan telekom:\n";
const TEXT_PROMPT_SUFFIX: &str = "\n\nKlasifikasi yang benar adalah: kelas ";
const TEXT_MAX_TOKENS: u32 = 10;

const AUDIO_SYSTEM_PROMPT: &str = "Kamu adalah model yang menentukan apakah percakapan yang dimasukkan dari dua orang dalam telepon tersebut adalah penipuan telekom atau tidak.";
const AUDIO_USER_PROMPT: &str = "Klasifikasi apakah tipe percakapan termasuk ke penipuan telekom";
const AUDIO_MAX_TOKENS: u32 = 200;

const TEMPERATURE: f32 = 0.1;
const HEALTH_PROMPT: &str = "Health check";

/// Buffered fragments between the upstream reader and the response writer.
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// Prefix of the single diagnostic fragment emitted when a stream fails.
pub const AUDIO_ERROR_PREFIX: &str = "Error processing audio: ";

/// One HTTP client bound to one backend.
#[derive(Clone)]
struct BackendClient {
    cfg: BackendConfig,
    http: Client,
}

impl BackendClient {
    fn new(cfg: &BackendConfig) -> Result<Self, AppError> {
        let http = Client::builder().timeout(cfg.timeout).build().map_err(|err| {
            AppError::internal(format!("failed to build HTTP client for {}: {err}", cfg.name))
        })?;
        Ok(Self {
            cfg: cfg.clone(),
            http,
        })
    }

    /// Runs a single-shot completion and returns the first choice's text.
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: Option<f32>,
        timeout: Option<Duration>,
    ) -> Result<String, UpstreamError> {
        let body = CompletionRequest {
            model: &self.cfg.model,
            prompt,
            max_tokens,
            temperature,
        };
        let mut request = self.http.post(self.cfg.endpoint("completions")).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = ensure_success(request.send().await?).await?;
        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or(UpstreamError::EmptyChoices)
    }
}

/// Production [`FraudClassifier`] talking to two vLLM servers.
pub struct OpenAiCompatBackend {
    text: BackendClient,
    audio: BackendClient,
    health_timeout: Duration,
}

impl OpenAiCompatBackend {
    pub fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        let backend = Self {
            text: BackendClient::new(&cfg.text_backend)?,
            audio: BackendClient::new(&cfg.audio_backend)?,
            health_timeout: cfg.health_timeout,
        };
        info!(
            text_backend = %backend.text.cfg.base_url,
            audio_backend = %backend.audio.cfg.base_url,
            "initialized upstream clients"
        );
        Ok(backend)
    }

    fn audio_request(&self, audio: &[u8]) -> RequestBuilder {
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        let body = ChatCompletionRequest {
            model: &self.audio.cfg.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(AUDIO_SYSTEM_PROMPT),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::Audio { audio: encoded },
                        ContentPart::Text {
                            text: AUDIO_USER_PROMPT,
                        },
                    ]),
                },
            ],
            max_tokens: AUDIO_MAX_TOKENS,
            temperature: TEMPERATURE,
            stream: true,
        };
        self.audio
            .http
            .post(self.audio.cfg.endpoint("chat/completions"))
            .json(&body)
    }
}

#[async_trait]
impl FraudClassifier for OpenAiCompatBackend {
    async fn classify_text(&self, text: &str) -> TextLabel {
        let prompt = text_prompt(text);
        let completion = match self
            .text
            .complete(&prompt, TEXT_MAX_TOKENS, Some(TEMPERATURE), None)
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!(
                    backend = self.text.cfg.name,
                    kind = err.kind(),
                    error = %err,
                    "text prediction failed; defaulting to normal"
                );
                return TextLabel::default();
            }
        };

        match parse_text_label(&completion) {
            Ok(label) => label,
            Err(err) => {
                warn!(
                    backend = self.text.cfg.name,
                    completion = %log_preview(completion.trim(), 50),
                    error = %err,
                    "could not parse text prediction; defaulting to normal"
                );
                TextLabel::default()
            }
        }
    }

    async fn classify_audio_stream(&self, audio: Vec<u8>, filename: &str) -> FragmentStream {
        let request = self.audio_request(&audio);
        drop(audio);

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let filename = filename.to_string();
        tokio::spawn(async move {
            let events: ChatEvents = match open_chat_stream(request).await {
                Ok(events) => events,
                Err(err) => stream::once(async move { Err(err) }).boxed(),
            };
            relay_fragments(events, tx, &filename).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn health_check(&self) -> Result<HealthReport, AppError> {
        let text = tokio::spawn(probe(self.text.clone(), self.health_timeout));
        let audio = tokio::spawn(probe(self.audio.clone(), self.health_timeout));
        let (text, audio) = tokio::join!(text, audio);

        let mut report = HealthReport::default();
        report.insert(
            self.text.cfg.name,
            text.map_err(|err| {
                AppError::service_unavailable(format!("health probe did not complete: {err}"))
            })?,
        );
        report.insert(
            self.audio.cfg.name,
            audio.map_err(|err| {
                AppError::service_unavailable(format!("health probe did not complete: {err}"))
            })?,
        );
        Ok(report)
    }
}

fn text_prompt(text: &str) -> String {
    format!("{TEXT_PROMPT_PREFIX}{text}{TEXT_PROMPT_SUFFIX}")
}

async fn probe(client: BackendClient, timeout: Duration) -> BackendHealth {
    match client
        .complete(HEALTH_PROMPT, 1, None, Some(timeout))
        .await
    {
        Ok(_) => BackendHealth::healthy(),
        Err(err) => {
            warn!(backend = client.cfg.name, kind = err.kind(), error = %err, "health probe failed");
            BackendHealth::unhealthy(err.to_string())
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        status,
        body: log_preview(body.trim(), 200),
    })
}

/// Item decoded from the upstream chat SSE stream.
#[derive(Debug, Clone, Eq, PartialEq)]
enum ChatEvent {
    Content(String),
    Done,
}

type ChatEvents = BoxStream<'static, Result<ChatEvent, UpstreamError>>;

async fn open_chat_stream(request: RequestBuilder) -> Result<ChatEvents, UpstreamError> {
    let response = ensure_success(request.send().await?).await?;
    let body = response.bytes_stream().map(|chunk| {
        chunk.map_err(|err| {
            if err.is_timeout() {
                UpstreamError::Timeout(err.to_string())
            } else {
                UpstreamError::Stream(err.to_string())
            }
        })
    });
    Ok(decode_sse_body(body))
}

/// Decodes a raw SSE body into chat events.
///
/// A last line without a trailing newline is still decoded once the body ends.
fn decode_sse_body<B>(body: B) -> ChatEvents
where
    B: Stream<Item = Result<Bytes, UpstreamError>> + Send + 'static,
{
    let state = Some((body.boxed(), SseDecoder::default()));
    stream::unfold(state, |state| async move {
        let (mut body, mut decoder) = state?;
        match body.next().await {
            Some(Ok(bytes)) => {
                let events = decoder.feed(&bytes);
                Some((events, Some((body, decoder))))
            }
            Some(Err(err)) => Some((vec![Err(err)], Some((body, decoder)))),
            None => Some((decoder.finish().into_iter().collect(), None)),
        }
    })
    .flat_map(stream::iter)
    .boxed()
}

/// Forwards upstream fragments into `tx` in arrival order.
///
/// Always finishes with a label fragment: the label parsed from the
/// accumulated text on success, or one diagnostic fragment followed by the
/// default label on the first error. Stops early if the receiver is gone.
async fn relay_fragments<S>(mut events: S, tx: mpsc::Sender<String>, filename: &str)
where
    S: Stream<Item = Result<ChatEvent, UpstreamError>> + Unpin,
{
    let mut transcript = String::new();
    let label = loop {
        match events.next().await {
            Some(Ok(ChatEvent::Content(fragment))) => {
                transcript.push_str(&fragment);
                if tx.send(fragment).await.is_err() {
                    debug!(filename, "client disconnected; dropping upstream stream");
                    return;
                }
            }
            Some(Ok(ChatEvent::Done)) | None => {
                break parse_audio_label(&transcript).unwrap_or_else(|err| {
                    warn!(
                        filename,
                        error = %err,
                        "audio analysis carried no label; defaulting to normal"
                    );
                    AudioLabel::default()
                });
            }
            Some(Err(err)) => {
                warn!(
                    filename,
                    kind = err.kind(),
                    error = %err,
                    "audio prediction failed; defaulting to normal"
                );
                if tx.send(format!("{AUDIO_ERROR_PREFIX}{err}")).await.is_err() {
                    return;
                }
                break AudioLabel::default();
            }
        }
    };

    debug!(filename, label = label.code(), "audio stream finished");
    let _ = tx.send(label.to_string()).await;
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Network chunks may split lines anywhere, including inside a multi-byte
/// character, so bytes are buffered until a full line is available.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ChatEvent, UpstreamError>> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }

    /// Decodes whatever is left once the body has ended.
    fn finish(&mut self) -> Option<Result<ChatEvent, UpstreamError>> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        parse_sse_line(line.trim_end_matches(['\r', '\n']))
    }
}

fn parse_sse_line(line: &str) -> Option<Result<ChatEvent, UpstreamError>> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(Ok(ChatEvent::Done));
    }

    let chunk = match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => chunk,
        Err(err) => {
            return Some(Err(UpstreamError::Decode(format!(
                "invalid stream chunk: {err}"
            ))))
        }
    };
    if let Some(error) = chunk.error {
        return Some(Err(UpstreamError::Stream(error.to_string())));
    }

    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(|content| Ok(ChatEvent::Content(content)))
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentPart<'a> {
    Audio { audio: String },
    Text { text: &'a str },
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
