//! Request transformer: Claude-dialect in, Gemini-dialect out.
//!
//! Pure — no I/O. The signature store is the one injected dependency, and
//! only its `has_valid` gate is consulted here.

use std::collections::HashMap;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::claude::{
    ChatMessage, ContentBlock, MessageContent, MessagesRequest, MessagesResponse, OutBlock, Usage,
};
use crate::gemini::{
    map_stop_reason, Content, FunctionCall, FunctionResponse, GeminiInternalRequest,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part, SystemInstruction,
    ThinkingConfig, ToolDeclarations,
};
use crate::signatures::{is_valid_signature, SignatureStore};

/// Marker carried by the injected identity block.
pub const IDENTITY_MARKER: &str = "--- [IDENTITY_PATCH] ---";

/// Token whose presence in a user-supplied system prompt suppresses
/// injection.
const IDENTITY_TOKEN: &str = "Antigravity";

/// Deterministic Claude → internal model routing. Unknown names pass
/// through verbatim.
const MODEL_ROUTES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "gemini-3-pro-preview"),
    ("claude-sonnet-4-5-thinking", "gemini-3-pro-preview"),
    ("claude-opus-4-1", "gemini-3-pro-preview"),
    ("claude-3-7-sonnet", "gemini-2.5-pro"),
    ("claude-3-5-haiku", "gemini-2.5-flash"),
];

/// Models in the `gemini-3` family support thinking mode and are subject to
/// the signature safety rule.
fn is_thinking_capable(model: &str) -> bool {
    model.starts_with("gemini-3")
}

/// Resolve a client model name. Returns the internal model ID and whether
/// the request targets the internal endpoint family.
pub fn route_model(model: &str) -> (String, bool) {
    for (from, to) in MODEL_ROUTES {
        if *from == model {
            return (to.to_string(), true);
        }
    }
    (model.to_string(), model.starts_with("gemini-"))
}

fn identity_block() -> String {
    format!(
        "{IDENTITY_MARKER}\nYou are Antigravity, an agentic AI coding assistant. \
         You answer truthfully, decline harmful requests, and never claim to be \
         a different assistant or model."
    )
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub body: GeminiInternalRequest,
    pub resolved_model: String,
    pub used_internal_endpoint: bool,
}

/// Rewrite a dialect-A request into the internal dialect-B body.
pub fn transform_request(
    req: &MessagesRequest,
    project_id: &str,
    signatures: &SignatureStore,
) -> TransformOutput {
    let (resolved_model, used_internal_endpoint) = route_model(&req.model);

    let contents = translate_messages(&req.messages);
    let system_instruction = build_system_instruction(req);
    let tools = build_tools(req);

    // Thinking safety: when the request carries tools and no prior turn left
    // a usable thought signature, sending a thinking config would make the
    // upstream reject the whole request with a 400. Dropping it silently
    // keeps the request alive at the cost of one non-thinking turn.
    let thinking_config = match &req.thinking {
        Some(thinking) if thinking.is_enabled() && is_thinking_capable(&resolved_model) => {
            if !req.tools.is_empty() && !signatures.has_valid() {
                debug!(model = %resolved_model, "dropping thinking config: tools present without signature");
                None
            } else {
                Some(ThinkingConfig {
                    thinking_budget: thinking.budget_tokens,
                })
            }
        }
        _ => None,
    };

    let body = GeminiInternalRequest {
        model: resolved_model.clone(),
        project: project_id.to_string(),
        request: GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            generation_config: GenerationConfig {
                max_output_tokens: req.max_tokens,
                temperature: req.temperature,
                top_p: req.top_p,
                thinking_config,
            },
        },
    };

    TransformOutput {
        body,
        resolved_model,
        used_internal_endpoint,
    }
}

/// Assemble `systemInstruction.parts` in order: identity block first unless
/// the caller already asserts the identity, then the caller's system text.
fn build_system_instruction(req: &MessagesRequest) -> Option<SystemInstruction> {
    let user_system = req.system.as_ref().map(|s| s.flatten()).unwrap_or_default();

    let mut parts = Vec::new();
    if !user_system.contains(IDENTITY_TOKEN) {
        parts.push(Part::text(identity_block()));
    }
    if !user_system.is_empty() {
        parts.push(Part::text(user_system));
    }

    if parts.is_empty() {
        None
    } else {
        Some(SystemInstruction { parts })
    }
}

fn build_tools(req: &MessagesRequest) -> Option<Vec<ToolDeclarations>> {
    if req.tools.is_empty() {
        return None;
    }
    let declarations = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.input_schema,
            })
        })
        .collect();
    Some(vec![ToolDeclarations {
        function_declarations: declarations,
    }])
}

/// Translate the conversation. Tool-call and tool-result turns become typed
/// parts; thinking text from prior turns is dropped (the upstream rejects
/// replayed thought text), but a valid signature rides along on the turn's
/// function call.
fn translate_messages(messages: &[ChatMessage]) -> Vec<Content> {
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::new();

    for message in messages {
        let role = match message.role.as_str() {
            "assistant" => "model",
            _ => "user",
        };
        let mut parts = Vec::new();
        let mut pending_signature: Option<String> = None;

        match &message.content {
            MessageContent::Text(text) => {
                if !text.is_empty() {
                    parts.push(Part::text(text.clone()));
                }
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(Part::text(text.clone()));
                            }
                        }
                        ContentBlock::Thinking { signature, .. } => {
                            if let Some(sig) = signature.as_deref().filter(|s| is_valid_signature(s))
                            {
                                pending_signature = Some(sig.to_string());
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_names.insert(id.clone(), name.clone());
                            parts.push(Part {
                                function_call: Some(FunctionCall {
                                    name: name.clone(),
                                    args: input.clone(),
                                }),
                                thought_signature: pending_signature.take(),
                                ..Default::default()
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let name = tool_names
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());
                            let text = content.as_ref().map(|c| c.flatten()).unwrap_or_default();
                            let response = if *is_error {
                                json!({ "error": text })
                            } else {
                                json!({ "result": text })
                            };
                            parts.push(Part {
                                function_response: Some(FunctionResponse { name, response }),
                                ..Default::default()
                            });
                        }
                        ContentBlock::Unknown => {}
                    }
                }
            }
        }

        // The upstream rejects empty part lists.
        if !parts.is_empty() {
            contents.push(Content {
                role: role.to_string(),
                parts,
            });
        }
    }
    contents
}

/// Translate a non-streaming dialect-B response into a dialect-A message.
/// Observed thought signatures are recorded for later turns.
pub fn translate_response(
    resp: &GenerateContentResponse,
    requested_model: &str,
    signatures: &SignatureStore,
) -> MessagesResponse {
    let mut content = Vec::new();
    let mut saw_tool_call = false;
    let mut finish_reason = None;

    if let Some(candidate) = resp.candidates.first() {
        finish_reason = candidate.finish_reason.clone();
        if let Some(body) = &candidate.content {
            for part in &body.parts {
                if let Some(sig) = part.thought_signature.as_deref() {
                    signatures.store(sig);
                }
                if let Some(call) = &part.function_call {
                    saw_tool_call = true;
                    content.push(OutBlock::ToolUse {
                        id: format!("toolu_{}", Uuid::new_v4().simple()),
                        name: call.name.clone(),
                        input: call.args.clone(),
                    });
                } else if let Some(text) = &part.text {
                    if part.thought {
                        content.push(OutBlock::Thinking {
                            thinking: text.clone(),
                            signature: part.thought_signature.clone(),
                        });
                    } else {
                        content.push(OutBlock::Text { text: text.clone() });
                    }
                }
            }
        }
    }

    let usage = resp
        .usage_metadata
        .map(|u| Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{}", Uuid::new_v4().simple()),
        kind: "message",
        role: "assistant",
        model: requested_model.to_string(),
        content,
        stop_reason: finish_reason
            .as_deref()
            .map(|r| map_stop_reason(r, saw_tool_call)),
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claude::{ThinkingRequest, ToolDefinition};
    use serde_json::Value;

    fn body_json(output: &TransformOutput) -> Value {
        serde_json::to_value(&output.body).unwrap()
    }

    fn base_request(model: &str) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": model,
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .unwrap()
    }

    fn weather_tool() -> ToolDefinition {
        serde_json::from_value(json!({
            "name": "get_weather",
            "description": "Current weather",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }))
        .unwrap()
    }

    fn thinking(budget: u32) -> ThinkingRequest {
        serde_json::from_value(json!({"type": "enabled", "budget_tokens": budget})).unwrap()
    }

    #[test]
    fn pure_thinking_passes_through() {
        let mut req = base_request("gemini-3-pro-preview");
        req.thinking = Some(thinking(1000));
        let store = SignatureStore::new();
        let out = transform_request(&req, "projects/p", &store);
        let json = body_json(&out);
        assert_eq!(
            json["request"]["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1000
        );
    }

    #[test]
    fn thinking_with_tools_and_no_signature_is_dropped() {
        let mut req = base_request("gemini-3-pro-preview");
        req.thinking = Some(thinking(1000));
        req.tools = vec![weather_tool()];
        let store = SignatureStore::new();
        let out = transform_request(&req, "projects/p", &store);
        let json = body_json(&out);
        assert!(json["request"]["generationConfig"]
            .get("thinkingConfig")
            .is_none());
        // Tools themselves are still declared.
        assert_eq!(
            json["request"]["tools"][0]["functionDeclarations"][0]["name"],
            "get_weather"
        );
    }

    #[test]
    fn thinking_with_tools_and_stored_signature_is_kept() {
        let mut req = base_request("gemini-3-pro-preview");
        req.thinking = Some(thinking(1000));
        req.tools = vec![weather_tool()];
        let store = SignatureStore::new();
        store.store("valid_signature_string_longer_than_10_chars");
        let out = transform_request(&req, "projects/p", &store);
        let json = body_json(&out);
        assert_eq!(
            json["request"]["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1000
        );
    }

    #[test]
    fn identity_is_injected_when_system_is_absent() {
        let req = base_request("claude-sonnet-4-5");
        let out = transform_request(&req, "projects/p", &SignatureStore::new());
        let json = body_json(&out);
        let first = json["request"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(first.contains("You are Antigravity"));
        assert!(first.contains("[IDENTITY_PATCH]"));
    }

    #[test]
    fn identity_is_not_injected_twice() {
        let mut req = base_request("claude-sonnet-4-5");
        req.system = Some(serde_json::from_value(json!("You are Antigravity, the best AI.")).unwrap());
        let out = transform_request(&req, "projects/p", &SignatureStore::new());
        let json = body_json(&out);
        let parts = json["request"]["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        for part in parts {
            assert!(!part["text"].as_str().unwrap().contains("[IDENTITY_PATCH]"));
        }
    }

    #[test]
    fn user_system_is_appended_after_identity() {
        let mut req = base_request("claude-sonnet-4-5");
        req.system = Some(serde_json::from_value(json!("Prefer short answers.")).unwrap());
        let out = transform_request(&req, "projects/p", &SignatureStore::new());
        let json = body_json(&out);
        let parts = json["request"]["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0]["text"].as_str().unwrap().contains("[IDENTITY_PATCH]"));
        assert_eq!(parts[1]["text"], "Prefer short answers.");
        // At most one part carries the marker.
        let marker_count = parts
            .iter()
            .filter(|p| p["text"].as_str().unwrap_or("").contains("[IDENTITY_PATCH]"))
            .count();
        assert_eq!(marker_count, 1);
    }

    #[test]
    fn model_routing_table_and_passthrough() {
        assert_eq!(
            route_model("claude-sonnet-4-5"),
            ("gemini-3-pro-preview".to_string(), true)
        );
        assert_eq!(
            route_model("gemini-3-pro-preview"),
            ("gemini-3-pro-preview".to_string(), true)
        );
        assert_eq!(
            route_model("grok-2-latest"),
            ("grok-2-latest".to_string(), false)
        );
    }

    #[test]
    fn tool_turns_become_typed_parts_in_order() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "gemini-3-pro-preview",
            "max_tokens": 256,
            "messages": [
                {"role": "user", "content": "weather in Oslo?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "checking", "signature": "sig_abcdef123456"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "Sunny, 21C"}
                ]}
            ]
        }))
        .unwrap();
        let out = transform_request(&req, "projects/p", &SignatureStore::new());
        let json = body_json(&out);
        let contents = json["request"]["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        let call = &contents[1]["parts"][0];
        assert_eq!(call["functionCall"]["name"], "get_weather");
        assert_eq!(call["functionCall"]["args"]["city"], "Oslo");
        // The thinking block's signature rides on the function call part.
        assert_eq!(call["thoughtSignature"], "sig_abcdef123456");
        let result = &contents[2]["parts"][0];
        assert_eq!(result["functionResponse"]["name"], "get_weather");
        assert_eq!(result["functionResponse"]["response"]["result"], "Sunny, 21C");
    }

    #[test]
    fn tool_result_error_flag_changes_payload_key() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "gemini-3-pro-preview",
            "max_tokens": 256,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "boom", "is_error": true}
                ]}
            ]
        }))
        .unwrap();
        let out = transform_request(&req, "projects/p", &SignatureStore::new());
        let json = body_json(&out);
        let part = &json["request"]["contents"][0]["parts"][0];
        // Unknown tool id falls back to the id itself as the name.
        assert_eq!(part["functionResponse"]["name"], "toolu_9");
        assert_eq!(part["functionResponse"]["response"]["error"], "boom");
    }

    #[test]
    fn generation_config_passthrough_and_project_binding() {
        let mut req = base_request("gemini-3-pro-preview");
        req.temperature = Some(0.4);
        req.top_p = Some(0.9);
        let out = transform_request(&req, "projects/demo-123", &SignatureStore::new());
        let json = body_json(&out);
        assert_eq!(json["project"], "projects/demo-123");
        assert_eq!(json["request"]["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(json["request"]["generationConfig"]["temperature"], 0.4);
        assert_eq!(json["request"]["generationConfig"]["topP"], 0.9);
    }

    #[test]
    fn translate_response_builds_message_and_records_signatures() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "mulling", "thought": true, "thoughtSignature": "sig_0123456789abcdef"},
                    {"text": "It is sunny."},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        }))
        .unwrap();
        let store = SignatureStore::new();
        let msg = translate_response(&resp, "claude-sonnet-4-5", &store);

        assert_eq!(msg.model, "claude-sonnet-4-5");
        assert_eq!(msg.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(msg.usage.input_tokens, 10);
        assert_eq!(msg.content.len(), 3);
        assert!(matches!(msg.content[0], OutBlock::Thinking { .. }));
        assert!(matches!(msg.content[2], OutBlock::ToolUse { .. }));
        assert!(store.has("sig_0123456789abcdef"));
    }
}
