use crate::models::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ContentPart,
    FunctionCall, GeneralOpenAIRequest, MessageContent, ResponseMessage, ToolCall, Usage,
};
use crate::protocol::anthropic::{
    self, ClaudeCompleteRequest, ClaudeCompleteResponse, ClaudeMessageRequest,
    ClaudeMessageResponse, ContentBlock, ImageSource, ToolChoice,
};
use serde_json::{json, Value};

/// 上游必填的 max_tokens 缺省值
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// 空文本占位，Claude 不接受空内容块
const EMPTY_CONTENT_PLACEHOLDER: &str = "...";

// ================== 请求转换 ==================

/// OpenAI 请求 -> 旧版 complete 请求
///
/// prompt 格式：
/// ```text
/// {system}\n\nHuman: hi\n\nAssistant: hello\n\nHuman: again\n\nAssistant:
/// ```
pub fn request_openai_to_claude_complete(
    request: &GeneralOpenAIRequest,
    model: &str,
) -> ClaudeCompleteRequest {
    let mut prompt = String::new();

    for message in &request.messages {
        match message.role.as_str() {
            "user" => {
                prompt.push_str("\n\nHuman: ");
                prompt.push_str(&message.string_content());
            }
            "assistant" => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&message.string_content());
            }
            // 只有出现在开头的 system 才作为前缀
            "system" if prompt.is_empty() => prompt = message.string_content(),
            _ => {}
        }
    }
    prompt.push_str("\n\nAssistant:");

    ClaudeCompleteRequest {
        model: model.to_string(),
        prompt,
        max_tokens_to_sample: max_tokens(request),
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stream: request.stream,
    }
}

/// OpenAI 请求 -> /v1/messages 请求
pub fn request_openai_to_claude_message(
    request: &GeneralOpenAIRequest,
    model: &str,
) -> ClaudeMessageRequest {
    let mut system_parts = Vec::new();
    let mut messages: Vec<anthropic::Message> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role.as_str() {
            "system" | "developer" => {
                let text = message.string_content();
                if !text.is_empty() {
                    system_parts.push(text);
                }
                continue;
            }
            "assistant" => ("assistant", assistant_blocks(message)),
            "tool" => (
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.string_content(),
                }],
            ),
            _ => ("user", content_blocks(message.content.as_ref())),
        };

        // 相邻同角色消息合并，Claude 要求 user/assistant 交替
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(anthropic::Message {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    // 第一条必须是 user
    if messages.first().map_or(true, |m| m.role != "user") {
        messages.insert(
            0,
            anthropic::Message {
                role: "user".to_string(),
                content: vec![ContentBlock::Text {
                    text: EMPTY_CONTENT_PLACEHOLDER.to_string(),
                }],
            },
        );
    }

    for message in &mut messages {
        if message.content.is_empty() {
            message.content.push(ContentBlock::Text {
                text: EMPTY_CONTENT_PLACEHOLDER.to_string(),
            });
        }
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|tool| anthropic::Tool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect()
    });

    ClaudeMessageRequest {
        model: model.to_string(),
        messages,
        max_tokens: max_tokens(request),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        stop_sequences: request.stop.as_ref().map(|s| s.to_vec()),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stream: request.stream,
        tool_choice: tools
            .as_ref()
            .and(request.tool_choice.as_ref())
            .and_then(convert_tool_choice),
        tools,
        metadata: request.user.as_ref().map(|user| anthropic::Metadata {
            user_id: user.clone(),
        }),
    }
}

fn max_tokens(request: &GeneralOpenAIRequest) -> u32 {
    request
        .max_tokens
        .or(request.max_completion_tokens)
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_TOKENS)
}

fn content_blocks(content: Option<&MessageContent>) -> Vec<ContentBlock> {
    match content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            vec![ContentBlock::Text { text: text.clone() }]
        }
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    Some(ContentBlock::Text { text: text.clone() })
                }
                ContentPart::Text { .. } => None,
                ContentPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                    source: image_source(&image_url.url),
                }),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn assistant_blocks(message: &crate::models::Message) -> Vec<ContentBlock> {
    let mut blocks = content_blocks(message.content.as_ref());

    for call in message.tool_calls.iter().flatten() {
        // 参数不是合法JSON时退化为空对象
        let input = serde_json::from_str::<Value>(&call.function.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone().unwrap_or_default(),
            name: call.function.name.clone().unwrap_or_default(),
            input,
        });
    }

    blocks
}

/// data:image/png;base64,xxxx 转为 base64 源，其他URL直接交给上游拉取
fn image_source(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.trim_end_matches(";base64").to_string();
            return ImageSource::Base64 {
                media_type,
                data: data.to_string(),
            };
        }
    }
    ImageSource::Url {
        url: url.to_string(),
    }
}

fn convert_tool_choice(choice: &Value) -> Option<ToolChoice> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "required" | "any" => Some(ToolChoice::Any),
            _ => None,
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

// ================== 响应转换 ==================

/// Claude stop_reason -> OpenAI finish_reason
pub fn stop_reason_to_finish_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" | "stop" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

pub fn usage_from_claude(usage: &anthropic::Usage) -> Usage {
    Usage {
        cache_read_tokens: usage.cache_read_input_tokens,
        cache_creation_tokens: usage.cache_creation_input_tokens,
        ..Usage::new(usage.input_tokens, usage.output_tokens)
    }
}

pub fn response_claude_message_to_openai(response: &ClaudeMessageResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                index: Some(tool_calls.len() as u32),
                id: Some(id.clone()),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: Some(name.clone()),
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: response.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: response
                .stop_reason
                .as_deref()
                .map(stop_reason_to_finish_reason),
        }],
        usage: response
            .usage
            .as_ref()
            .map(usage_from_claude)
            .unwrap_or_default(),
    }
}

pub fn response_claude_complete_to_openai(response: &ClaudeCompleteResponse) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: response
            .id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: response.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(response.completion.trim_start().to_string()),
                ..Default::default()
            },
            finish_reason: response
                .stop_reason
                .as_deref()
                .map(stop_reason_to_finish_reason),
        }],
        usage: response
            .usage
            .as_ref()
            .map(usage_from_claude)
            .unwrap_or_default(),
    }
}

/// 构造单 choice 的流式 chunk
pub fn stream_chunk(
    id: &str,
    model: &str,
    delta: ResponseMessage,
    finish_reason: Option<String>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FunctionDefinition, ImageUrl, Message, StopSequences, Tool};

    fn request(messages: Vec<Message>) -> GeneralOpenAIRequest {
        GeneralOpenAIRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn message_mode_extracts_system_and_defaults_max_tokens() {
        let req = request(vec![
            Message::text("system", "be brief"),
            Message::text("system", "answer in english"),
            Message::text("user", "hi"),
        ]);

        let claude = request_openai_to_claude_message(&req, "claude-sonnet-4-20250514");
        assert_eq!(claude.system.as_deref(), Some("be brief\nanswer in english"));
        assert_eq!(claude.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(claude.messages.len(), 1);
        assert_eq!(claude.messages[0].role, "user");
    }

    #[test]
    fn message_mode_merges_roles_and_leads_with_user() {
        let req = request(vec![
            Message::text("assistant", "hello"),
            Message::text("user", "a"),
            Message::text("user", "b"),
        ]);

        let claude = request_openai_to_claude_message(&req, "m");
        let roles: Vec<_> = claude.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(claude.messages[2].content.len(), 2);
        assert_eq!(
            claude.messages[0].content[0],
            ContentBlock::Text { text: "...".into() }
        );
    }

    #[test]
    fn message_mode_maps_parameters() {
        let mut req = request(vec![Message::text("user", "hi")]);
        req.max_tokens = Some(256);
        req.temperature = Some(0.2);
        req.stop = Some(StopSequences::Multiple(vec!["\n\nHuman:".into()]));
        req.stream = Some(true);
        req.user = Some("u-1".into());

        let claude = request_openai_to_claude_message(&req, "mapped-model");
        assert_eq!(claude.model, "mapped-model");
        assert_eq!(claude.max_tokens, 256);
        assert_eq!(claude.temperature, Some(0.2));
        assert_eq!(claude.stop_sequences, Some(vec!["\n\nHuman:".to_string()]));
        assert_eq!(claude.stream, Some(true));
        assert_eq!(claude.metadata.unwrap().user_id, "u-1");
    }

    #[test]
    fn message_mode_converts_images_and_tools() {
        let mut req = request(vec![
            Message {
                role: "user".into(),
                content: Some(MessageContent::Parts(vec![
                    ContentPart::Text { text: "what is this".into() },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,iVBORw0".into(),
                            detail: None,
                        },
                    },
                ])),
                ..Default::default()
            },
            Message {
                role: "assistant".into(),
                tool_calls: Some(vec![ToolCall {
                    index: None,
                    id: Some("toolu_1".into()),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: Some("lookup".into()),
                        arguments: r#"{"q":"cat"}"#.into(),
                    },
                }]),
                ..Default::default()
            },
            Message {
                role: "tool".into(),
                content: Some(MessageContent::Text("a cat".into())),
                tool_call_id: Some("toolu_1".into()),
                ..Default::default()
            },
        ]);
        req.tools = Some(vec![Tool {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: "lookup".into(),
                description: None,
                parameters: None,
            },
        }]);
        req.tool_choice = Some(json!("required"));

        let claude = request_openai_to_claude_message(&req, "m");
        assert_eq!(
            claude.messages[0].content[1],
            ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".into(),
                    data: "iVBORw0".into()
                }
            }
        );
        assert_eq!(
            claude.messages[1].content[0],
            ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "lookup".into(),
                input: json!({"q": "cat"})
            }
        );
        assert_eq!(claude.messages[2].role, "user");
        assert!(matches!(
            claude.messages[2].content[0],
            ContentBlock::ToolResult { ref tool_use_id, .. } if tool_use_id == "toolu_1"
        ));
        let tools = claude.tools.unwrap();
        assert_eq!(tools[0].input_schema["type"], "object");
        assert_eq!(claude.tool_choice, Some(ToolChoice::Any));
    }

    #[test]
    fn tool_choice_without_tools_is_dropped() {
        let mut req = request(vec![Message::text("user", "hi")]);
        req.tool_choice = Some(json!("auto"));
        let claude = request_openai_to_claude_message(&req, "m");
        assert!(claude.tools.is_none());
        assert!(claude.tool_choice.is_none());
    }

    #[test]
    fn complete_mode_builds_prompt() {
        let req = request(vec![
            Message::text("system", "You are helpful."),
            Message::text("user", "hi"),
            Message::text("assistant", "hello"),
            Message::text("user", "again"),
        ]);

        let claude = request_openai_to_claude_complete(&req, "claude-2.1");
        assert_eq!(
            claude.prompt,
            "You are helpful.\n\nHuman: hi\n\nAssistant: hello\n\nHuman: again\n\nAssistant:"
        );
        assert_eq!(claude.max_tokens_to_sample, DEFAULT_MAX_TOKENS);
        assert_eq!(claude.model, "claude-2.1");
    }

    #[test]
    fn empty_request_still_maps() {
        let req = request(Vec::new());
        let message = request_openai_to_claude_message(&req, "m");
        assert_eq!(message.messages.len(), 1);
        let complete = request_openai_to_claude_complete(&req, "m");
        assert_eq!(complete.prompt, "\n\nAssistant:");
    }

    #[test]
    fn message_response_converts_to_openai() {
        let response: ClaudeMessageResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 3}
        }))
        .unwrap();

        let openai = response_claude_message_to_openai(&response);
        let choice = &openai.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Hello"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
        assert_eq!(openai.usage.prompt_tokens, 10);
        assert_eq!(openai.usage.completion_tokens, 5);
        assert_eq!(openai.usage.total_tokens, 15);
        assert_eq!(openai.usage.cache_read_tokens, 3);
    }

    #[test]
    fn stop_reasons_map_to_finish_reasons() {
        assert_eq!(stop_reason_to_finish_reason("end_turn"), "stop");
        assert_eq!(stop_reason_to_finish_reason("stop_sequence"), "stop");
        assert_eq!(stop_reason_to_finish_reason("max_tokens"), "length");
        assert_eq!(stop_reason_to_finish_reason("tool_use"), "tool_calls");
        assert_eq!(stop_reason_to_finish_reason("refusal"), "refusal");
    }
}
