//! Response translation: CLI events out as OpenAI completions or SSE chunks.

use axum::response::sse::Event;
use futures::StreamExt;
use futures_util::stream;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_stream::Stream;

use crate::error::{BridgeError, ErrorBody};
use crate::process::CliEvent;
use crate::types::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChoiceChunk, Delta, ResponseMessage,
    Role, Usage,
};

const FINISH_STOP: &str = "stop";

/// Identity shared by every object emitted for one request.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl ResponseContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: unix_now(),
            model: model.into(),
        }
    }

    pub fn completion(&self, content: String, usage: Usage) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: self.id.clone(),
            object: "chat.completion",
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason: FINISH_STOP,
            }],
            usage,
        }
    }

    fn chunk(
        &self,
        delta: Delta,
        finish_reason: Option<&'static str>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChoiceChunk {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Drain an invocation into a single `chat.completion`.
///
/// Any error, even after text was produced, fails the whole response.
pub async fn collect_completion<S>(
    ctx: &ResponseContext,
    mut events: S,
) -> Result<ChatCompletionResponse, BridgeError>
where
    S: Stream<Item = Result<CliEvent, BridgeError>> + Unpin,
{
    let mut content = String::new();
    while let Some(event) = events.next().await {
        match event? {
            CliEvent::Delta(text) => content.push_str(&text),
            CliEvent::Finished(usage) => {
                tracing::info!(
                    completion_id = %ctx.id,
                    response_length = content.len(),
                    "Completed buffered response"
                );
                return Ok(ctx.completion(content, usage));
            }
        }
    }
    Err(BridgeError::Truncated)
}

/// One SSE frame of a streamed completion.
#[derive(Debug)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    /// Terminates a failed stream; no `[DONE]` follows.
    Error(ErrorBody),
    /// The `[DONE]` sentinel.
    Done,
}

impl StreamFrame {
    pub fn into_event(self) -> Event {
        match self {
            StreamFrame::Chunk(chunk) => {
                let json_data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
                Event::default().data(json_data)
            }
            StreamFrame::Error(body) => {
                let json_data = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
                Event::default().data(json_data)
            }
            StreamFrame::Done => Event::default().data("[DONE]"),
        }
    }
}

enum Phase {
    Streaming,
    SendDone,
    Ended,
}

struct ChunkState<S> {
    events: S,
    ctx: ResponseContext,
    role_sent: bool,
    phase: Phase,
}

impl<S> ChunkState<S> {
    fn delta(&mut self, content: Option<String>) -> Delta {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some(Role::Assistant)
        };
        Delta { role, content }
    }
}

/// Map an invocation onto `chat.completion.chunk` frames.
///
/// Deltas are forwarded as they arrive. A clean finish adds one chunk with
/// `finish_reason` and the usage totals, then `[DONE]`. A failure adds one
/// error frame and ends the stream.
pub fn completion_chunks<S>(ctx: ResponseContext, events: S) -> impl Stream<Item = StreamFrame>
where
    S: Stream<Item = Result<CliEvent, BridgeError>> + Unpin,
{
    let state = ChunkState {
        events,
        ctx,
        role_sent: false,
        phase: Phase::Streaming,
    };

    stream::unfold(state, |mut state| async move {
        match state.phase {
            Phase::Ended => None,
            Phase::SendDone => {
                state.phase = Phase::Ended;
                Some((StreamFrame::Done, state))
            }
            Phase::Streaming => {
                let frame = match state.events.next().await {
                    Some(Ok(CliEvent::Delta(text))) => {
                        let delta = state.delta(Some(text));
                        StreamFrame::Chunk(state.ctx.chunk(delta, None, None))
                    }
                    Some(Ok(CliEvent::Finished(usage))) => {
                        tracing::info!(completion_id = %state.ctx.id, "Completed streaming response");
                        state.phase = Phase::SendDone;
                        let delta = state.delta(None);
                        StreamFrame::Chunk(state.ctx.chunk(delta, Some(FINISH_STOP), Some(usage)))
                    }
                    Some(Err(e)) => {
                        tracing::error!(completion_id = %state.ctx.id, error = %e, "Streaming response failed");
                        state.phase = Phase::Ended;
                        StreamFrame::Error(e.body())
                    }
                    None => {
                        state.phase = Phase::Ended;
                        StreamFrame::Error(BridgeError::Truncated.body())
                    }
                };
                Some((frame, state))
            }
        }
    })
}
