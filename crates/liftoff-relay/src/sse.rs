//! Upstream SSE reframing: Gemini-dialect frames in, Claude-dialect events
//! out.
//!
//! The upstream speaks `data: {GenerateContentResponse}` frames; clients
//! expect the `message_start` / `content_block_*` / `message_delta` /
//! `message_stop` event grammar. Frames are forwarded with minimal parsing —
//! only block boundaries, the terminating frame, and error frames require
//! structural awareness. Chunks are re-emitted in arrival order.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatch::unwrap_response;
use crate::gemini::{map_stop_reason, GenerateContentResponse};
use crate::signatures::SignatureStore;

/// One outbound SSE frame: `event: <event>\ndata: <data>\n\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutFrame {
    pub event: &'static str,
    pub data: Value,
}

#[derive(PartialEq, Clone, Copy)]
enum BlockKind {
    Text,
    Thinking,
}

/// Streaming state machine. Feed it decoded `data:` payloads; it yields the
/// dialect-A frames to forward.
pub struct Reframer {
    model: String,
    signatures: Arc<SignatureStore>,
    message_id: String,
    started: bool,
    next_block: usize,
    open: Option<(BlockKind, usize)>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    saw_tool_call: bool,
}

impl Reframer {
    pub fn new(model: String, signatures: Arc<SignatureStore>) -> Self {
        Self {
            model,
            signatures,
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            started: false,
            next_block: 0,
            open: None,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            saw_tool_call: false,
        }
    }

    /// Process one upstream `data:` payload.
    pub fn on_data(&mut self, data: &str) -> Vec<OutFrame> {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparsable upstream frame");
                return Vec::new();
            }
        };
        let value = unwrap_response(value);

        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            warn!(message, "upstream stream error frame");
            return vec![error_frame(message)];
        }

        let chunk: GenerateContentResponse = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping non-chunk upstream frame");
                return Vec::new();
            }
        };

        let mut frames = Vec::new();
        if let Some(usage) = chunk.usage_metadata {
            self.input_tokens = usage.prompt_token_count;
            self.output_tokens = usage.candidates_token_count;
        }
        self.ensure_started(&mut frames);

        if let Some(candidate) = chunk.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(sig) = part.thought_signature.as_deref() {
                        self.signatures.store(sig);
                    }
                    if let Some(call) = &part.function_call {
                        self.saw_tool_call = true;
                        self.close_open(&mut frames);
                        let index = self.next_block;
                        self.next_block += 1;
                        frames.push(OutFrame {
                            event: "content_block_start",
                            data: json!({
                                "type": "content_block_start",
                                "index": index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": format!("toolu_{}", Uuid::new_v4().simple()),
                                    "name": call.name,
                                    "input": {},
                                },
                            }),
                        });
                        frames.push(OutFrame {
                            event: "content_block_delta",
                            data: json!({
                                "type": "content_block_delta",
                                "index": index,
                                "delta": {
                                    "type": "input_json_delta",
                                    "partial_json": call.args.to_string(),
                                },
                            }),
                        });
                        frames.push(OutFrame {
                            event: "content_block_stop",
                            data: json!({"type": "content_block_stop", "index": index}),
                        });
                    } else if let Some(text) = part.text.as_deref() {
                        if part.thought {
                            let index = self.ensure_open(BlockKind::Thinking, &mut frames);
                            frames.push(OutFrame {
                                event: "content_block_delta",
                                data: json!({
                                    "type": "content_block_delta",
                                    "index": index,
                                    "delta": {"type": "thinking_delta", "thinking": text},
                                }),
                            });
                            if let Some(sig) = part.thought_signature.as_deref() {
                                frames.push(OutFrame {
                                    event: "content_block_delta",
                                    data: json!({
                                        "type": "content_block_delta",
                                        "index": index,
                                        "delta": {"type": "signature_delta", "signature": sig},
                                    }),
                                });
                            }
                        } else {
                            let index = self.ensure_open(BlockKind::Text, &mut frames);
                            frames.push(OutFrame {
                                event: "content_block_delta",
                                data: json!({
                                    "type": "content_block_delta",
                                    "index": index,
                                    "delta": {"type": "text_delta", "text": text},
                                }),
                            });
                        }
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason.as_deref() {
                self.stop_reason = Some(map_stop_reason(reason, self.saw_tool_call));
            }
        }
        frames
    }

    /// Close out the message: final block stop, usage delta, message stop.
    pub fn finish(&mut self) -> Vec<OutFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        self.close_open(&mut frames);
        frames.push(OutFrame {
            event: "message_delta",
            data: json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self.stop_reason.clone().unwrap_or_else(|| "end_turn".into()),
                    "stop_sequence": null,
                },
                "usage": {"output_tokens": self.output_tokens},
            }),
        });
        frames.push(OutFrame {
            event: "message_stop",
            data: json!({"type": "message_stop"}),
        });
        frames
    }

    fn ensure_started(&mut self, frames: &mut Vec<OutFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(OutFrame {
            event: "message_start",
            data: json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                },
            }),
        });
    }

    fn ensure_open(&mut self, kind: BlockKind, frames: &mut Vec<OutFrame>) -> usize {
        if let Some((open_kind, index)) = self.open {
            if open_kind == kind {
                return index;
            }
        }
        self.close_open(frames);
        let index = self.next_block;
        self.next_block += 1;
        let block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
        };
        frames.push(OutFrame {
            event: "content_block_start",
            data: json!({
                "type": "content_block_start",
                "index": index,
                "content_block": block,
            }),
        });
        self.open = Some((kind, index));
        index
    }

    fn close_open(&mut self, frames: &mut Vec<OutFrame>) {
        if let Some((_, index)) = self.open.take() {
            frames.push(OutFrame {
                event: "content_block_stop",
                data: json!({"type": "content_block_stop", "index": index}),
            });
        }
    }
}

fn error_frame(message: &str) -> OutFrame {
    OutFrame {
        event: "error",
        data: json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        }),
    }
}

/// Drive the upstream byte stream through the reframer, sending frames to
/// `tx`. Returns when the upstream closes or the receiver is dropped —
/// dropping the receiver is how a client disconnect cancels the upstream
/// read.
pub async fn pump(
    resp: reqwest::Response,
    requested_model: String,
    signatures: Arc<SignatureStore>,
    tx: mpsc::Sender<OutFrame>,
) {
    use futures_util::StreamExt;

    let mut reframer = Reframer::new(requested_model, signatures);
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(error_frame(&e.to_string())).await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            for frame in reframer.on_data(data) {
                if tx.send(frame).await.is_err() {
                    return; // receiver dropped — client went away
                }
            }
        }
        line_buf = remainder;
    }

    for frame in reframer.finish() {
        if tx.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reframer() -> (Reframer, Arc<SignatureStore>) {
        let signatures = Arc::new(SignatureStore::new());
        (
            Reframer::new("claude-sonnet-4-5".into(), signatures.clone()),
            signatures,
        )
    }

    fn events(frames: &[OutFrame]) -> Vec<&'static str> {
        frames.iter().map(|f| f.event).collect()
    }

    #[test]
    fn text_stream_produces_message_grammar() {
        let (mut r, _) = reframer();
        let mut frames = Vec::new();
        frames.extend(r.on_data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}],"usageMetadata":{"promptTokenCount":4}}"#,
        ));
        frames.extend(r.on_data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}"#,
        ));
        frames.extend(r.finish());

        assert_eq!(
            events(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(frames[0].data["message"]["usage"]["input_tokens"], 4);
        assert_eq!(frames[2].data["delta"]["text"], "Hel");
        assert_eq!(frames[3].data["delta"]["text"], "lo");
        assert_eq!(frames[5].data["delta"]["stop_reason"], "end_turn");
        assert_eq!(frames[5].data["usage"]["output_tokens"], 2);
    }

    #[test]
    fn thinking_then_text_switches_blocks() {
        let (mut r, signatures) = reframer();
        let mut frames = Vec::new();
        frames.extend(r.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true,"thoughtSignature":"sig_1234567890"}]}}]}"#,
        ));
        frames.extend(r.on_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"answer"}]},"finishReason":"STOP"}]}"#,
        ));
        frames.extend(r.finish());

        assert_eq!(
            events(&frames),
            vec![
                "message_start",
                "content_block_start", // thinking
                "content_block_delta", // thinking_delta
                "content_block_delta", // signature_delta
                "content_block_stop",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(frames[1].data["content_block"]["type"], "thinking");
        assert_eq!(frames[3].data["delta"]["type"], "signature_delta");
        assert_eq!(frames[5].data["content_block"]["type"], "text");
        // The signature was recorded for future turns.
        assert!(signatures.has("sig_1234567890"));
    }

    #[test]
    fn function_call_emits_atomic_tool_block_and_tool_use_stop_reason() {
        let (mut r, _) = reframer();
        let mut frames = Vec::new();
        frames.extend(r.on_data(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"Oslo"}}}]},"finishReason":"STOP"}]}"#,
        ));
        frames.extend(r.finish());

        assert_eq!(
            events(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(frames[1].data["content_block"]["type"], "tool_use");
        assert_eq!(frames[1].data["content_block"]["name"], "get_weather");
        let partial = frames[2].data["delta"]["partial_json"].as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(partial).unwrap(),
            serde_json::json!({"city": "Oslo"})
        );
        assert_eq!(frames[4].data["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn double_wrapped_frames_are_unwrapped() {
        let (mut r, _) = reframer();
        let frames = r.on_data(
            r#"{"response":{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}}"#,
        );
        assert_eq!(events(&frames), vec!["message_start", "content_block_start", "content_block_delta"]);
    }

    #[test]
    fn error_frames_pass_structurally() {
        let (mut r, _) = reframer();
        let frames = r.on_data(r#"{"error":{"message":"internal error","code":500}}"#);
        assert_eq!(events(&frames), vec!["error"]);
        assert_eq!(frames[0].data["error"]["message"], "internal error");
    }

    #[test]
    fn done_and_garbage_frames_are_ignored() {
        let (mut r, _) = reframer();
        assert!(r.on_data("[DONE]").is_empty());
        assert!(r.on_data("not json").is_empty());
        assert!(r.on_data("").is_empty());
    }
}
