use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 发往 Claude 上游的请求体，每个请求只会生成其中一种
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClaudeRequest {
    /// 旧版 /v1/complete
    Complete(ClaudeCompleteRequest),
    /// /v1/messages
    Message(ClaudeMessageRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCompleteRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens_to_sample: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessageRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// 未识别的块类型（如 redacted_thinking），转换时忽略
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImageSource {
    #[serde(rename = "base64")]
    Base64 { media_type: String, data: String },
    #[serde(rename = "url")]
    Url { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub user_id: String,
}

/// /v1/messages 非流式响应
///
/// `content` 必须存在，缺少它的JSON不是消息响应
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeMessageResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// /v1/complete 非流式响应，流式事件也是同样的形状
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeCompleteResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: String,
    pub completion: String,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

/// 上游错误体：{"type":"error","error":{"type":"...","message":"..."}}
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeErrorBody {
    pub error: ClaudeError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// 流式事件
/// 旧版 complete 模式的事件类型是 "completion"
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: Delta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ClaudeError,
    },
    Completion {
        #[serde(default)]
        completion: String,
        stop_reason: Option<String>,
        #[serde(default)]
        model: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDelta {
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_message_start_event() {
        let event: ClaudeStreamEvent = serde_json::from_str(
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4-20250514","usage":{"input_tokens":10,"output_tokens":1}}}"#,
        )
        .unwrap();

        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "msg_1");
                assert_eq!(message.usage.unwrap().input_tokens, 10);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn responses_without_their_body_field_do_not_decode() {
        for body in [json!({}), json!({"detail": "maintenance"})] {
            assert!(serde_json::from_value::<ClaudeMessageResponse>(body.clone()).is_err());
            assert!(serde_json::from_value::<ClaudeCompleteResponse>(body).is_err());
        }

        let empty: ClaudeMessageResponse =
            serde_json::from_value(json!({"type": "message", "content": []})).unwrap();
        assert!(empty.content.is_empty());
    }

    #[test]
    fn decodes_legacy_completion_event() {
        let event: ClaudeStreamEvent = serde_json::from_str(
            r#"{"type":"completion","completion":" Hello","stop_reason":null,"model":"claude-2.1"}"#,
        )
        .unwrap();
        assert!(matches!(event, ClaudeStreamEvent::Completion { ref completion, .. } if completion == " Hello"));
    }

    #[test]
    fn message_request_serializes_without_empty_options() {
        let req = ClaudeRequest::Message(ClaudeMessageRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages: vec![Message {
                role: "user".into(),
                content: vec![ContentBlock::Text { text: "hi".into() }],
            }],
            max_tokens: 4096,
            system: None,
            stop_sequences: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stream: Some(true),
            tools: None,
            tool_choice: Some(ToolChoice::Tool { name: "lookup".into() }),
            metadata: None,
        });

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["max_tokens"], 4096);
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
        assert_eq!(value["tool_choice"]["type"], "tool");
        assert_eq!(value["tool_choice"]["name"], "lookup");
        assert!(value.get("system").is_none());
        assert!(value.get("max_tokens_to_sample").is_none());
    }
}
