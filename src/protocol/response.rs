use crate::error::Error;
use crate::models::{ChatCompletionChunk, ChatCompletionResponse, FunctionCall, RelayInfo, ResponseMessage, ToolCall, Usage};
use crate::protocol::anthropic::{
    ClaudeCompleteResponse, ClaudeErrorBody, ClaudeMessageResponse, ClaudeStreamEvent,
    ContentBlock, Delta,
};
use crate::protocol::claude_code::RequestMode;
use crate::protocol::convert::{
    response_claude_complete_to_openai, response_claude_message_to_openai,
    stop_reason_to_finish_reason, stream_chunk,
};
use crate::protocol::detector::{DecodePath, StreamDetector};
use crate::usage_collector::{SseBuffer, SseFrame, StreamUsageCollector};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Response;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 日志和错误信息里原始body的最大长度
const BODY_PREVIEW_BYTES: usize = 512;

/// 写给客户端的帧，按上游顺序发送
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Chunk(ChatCompletionChunk),
    Body(ChatCompletionResponse),
    Done,
    /// 解码失败后由中转层写入，adaptor 自己不发送
    Error { status: u16, body: Value },
}

impl ClientFrame {
    pub fn from_error(error: &Error) -> Self {
        ClientFrame::Error {
            status: error.status_code(),
            body: error.to_openai_error(),
        }
    }
}

/// 客户端写出端，接收端被丢弃即视为客户端断开
pub type ClientSink = mpsc::Sender<ClientFrame>;

/// 一次请求的最终结果：用量交给计费，错误交给路由层
#[derive(Debug, Default)]
pub struct NormalizedResult {
    pub usage: Option<Usage>,
    pub error: Option<Error>,
}

impl NormalizedResult {
    pub fn success(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            error: None,
        }
    }

    pub fn failure(error: Error) -> Self {
        Self {
            usage: None,
            error: Some(error),
        }
    }

    /// 流中途失败：已经产生的用量仍然上报
    fn partial(collector: &StreamUsageCollector, error: Error) -> Self {
        Self {
            usage: collector.has_usage().then(|| collector.usage()),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 处理上游响应
///
/// 非2xx直接按错误体解码；否则由 [`StreamDetector::decode_path`] 选择流式或同步解码。
pub async fn normalize(
    response: Response,
    info: &RelayInfo,
    mode: RequestMode,
    sink: &ClientSink,
    idle_timeout: Duration,
) -> NormalizedResult {
    if !response.status().is_success() {
        return NormalizedResult::failure(error_handler(response).await);
    }

    let result = match StreamDetector::decode_path(response.headers(), info) {
        DecodePath::Stream => {
            if !info.is_stream {
                info!(
                    "[{}] upstream answered with SSE for a non-stream request, forcing stream mode",
                    info.request_id
                );
            }
            stream_handler(response, info, sink, idle_timeout).await
        }
        DecodePath::Sync => handler(response, mode, sink).await,
    };

    debug!(
        "[{}] response finished in {:?}, usage: {:?}, error: {:?}",
        info.request_id,
        info.start_time.elapsed(),
        result.usage,
        result.error
    );
    result
}

/// 上游错误类型对应的HTTP状态码
pub fn status_for_error_type(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}

fn preview(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_BYTES)]).into_owned()
}

async fn error_handler(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_else(|_| Bytes::new());

    warn!("Upstream error response (status {}): {}", status, preview(&body));

    match serde_json::from_slice::<ClaudeErrorBody>(&body) {
        Ok(parsed) if !parsed.error.message.is_empty() || !parsed.error.error_type.is_empty() => {
            Error::Upstream {
                status,
                error_type: parsed.error.error_type,
                message: parsed.error.message,
            }
        }
        _ => Error::Upstream {
            status,
            error_type: "bad_response_status_code".to_string(),
            message: format!("bad response status code {}: {}", status, preview(&body)),
        },
    }
}

// ================== 同步解码 ==================

async fn handler(response: Response, mode: RequestMode, sink: &ClientSink) -> NormalizedResult {
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return NormalizedResult::failure(Error::Http(e)),
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return NormalizedResult::failure(Error::MalformedResponse("empty response body".into()));
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return NormalizedResult::failure(Error::MalformedResponse(format!(
                "{}: {}",
                e,
                preview(&body)
            )))
        }
    };

    // 200 但内容是错误体
    if value.get("type").and_then(Value::as_str) == Some("error") {
        let parsed: Option<ClaudeErrorBody> = serde_json::from_value(value.clone()).ok();
        let (error_type, message) = parsed
            .map(|p| (p.error.error_type, p.error.message))
            .unwrap_or_else(|| ("upstream_error".to_string(), preview(&body)));
        return NormalizedResult::failure(Error::Upstream {
            status: status_for_error_type(&error_type),
            error_type,
            message,
        });
    }

    let decoded = match mode {
        RequestMode::Message => serde_json::from_value::<ClaudeMessageResponse>(value)
            .map(|r| (response_claude_message_to_openai(&r), r.usage.is_some())),
        RequestMode::Completion => serde_json::from_value::<ClaudeCompleteResponse>(value)
            .map(|r| (response_claude_complete_to_openai(&r), r.usage.is_some())),
    };

    let (openai, has_usage) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            return NormalizedResult::failure(Error::MalformedResponse(format!(
                "{}: {}",
                e,
                preview(&body)
            )))
        }
    };

    if !has_usage {
        warn!("Upstream response carries no usage, reporting zero tokens");
    }

    let usage = openai.usage;
    if sink.send(ClientFrame::Body(openai)).await.is_err() {
        return NormalizedResult {
            usage: Some(usage),
            error: Some(Error::Cancelled),
        };
    }

    NormalizedResult::success(usage)
}

// ================== 流式解码 ==================

/// 流式解码状态，每个请求一个
struct StreamState {
    id: String,
    model: String,
    collector: StreamUsageCollector,
    // content block index -> OpenAI tool_calls index
    tool_indexes: HashMap<u32, u32>,
    finished: bool,
}

impl StreamState {
    fn new(info: &RelayInfo) -> Self {
        Self {
            id: format!("chatcmpl-{}", info.request_id),
            model: info.upstream_model.clone(),
            collector: StreamUsageCollector::new(),
            tool_indexes: HashMap::new(),
            finished: false,
        }
    }

    fn chunk(&self, delta: ResponseMessage, finish_reason: Option<String>) -> ClientFrame {
        ClientFrame::Chunk(stream_chunk(&self.id, &self.model, delta, finish_reason))
    }

    fn tool_delta(index: u32, id: Option<String>, name: Option<String>, arguments: String) -> ResponseMessage {
        ResponseMessage {
            tool_calls: Some(vec![ToolCall {
                index: Some(index),
                id,
                call_type: "function".to_string(),
                function: FunctionCall { name, arguments },
            }]),
            ..Default::default()
        }
    }

    /// 处理一个SSE事件，返回需要转发给客户端的帧
    fn handle(&mut self, frame: &SseFrame) -> Result<Vec<ClientFrame>, Error> {
        // Claude 不发送 [DONE]，流只能由 message_stop 结束
        if frame.data.trim() == "[DONE]" {
            return Ok(Vec::new());
        }

        let event: ClaudeStreamEvent = serde_json::from_str(&frame.data).map_err(|e| {
            Error::MalformedResponse(format!("{}: {}", e, preview(frame.data.as_bytes())))
        })?;

        let mut out = Vec::new();
        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                if let Some(usage) = &message.usage {
                    self.collector.record(usage);
                }
                out.push(self.chunk(
                    ResponseMessage {
                        role: "assistant".to_string(),
                        content: Some(String::new()),
                        ..Default::default()
                    },
                    None,
                ));
            }
            ClaudeStreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, .. },
            } => {
                let tool_index = self.tool_indexes.len() as u32;
                self.tool_indexes.insert(index, tool_index);
                out.push(self.chunk(
                    Self::tool_delta(tool_index, Some(id), Some(name), String::new()),
                    None,
                ));
            }
            ClaudeStreamEvent::ContentBlockStart { .. } => {}
            ClaudeStreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => out.push(self.chunk(
                    ResponseMessage {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )),
                Delta::ThinkingDelta { thinking } => out.push(self.chunk(
                    ResponseMessage {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    },
                    None,
                )),
                Delta::InputJsonDelta { partial_json } => match self.tool_indexes.get(&index) {
                    Some(&tool_index) => out.push(self.chunk(
                        Self::tool_delta(tool_index, None, None, partial_json),
                        None,
                    )),
                    None => warn!(
                        "input_json_delta for content block {} without tool_use start, dropped",
                        index
                    ),
                },
                Delta::SignatureDelta { .. } | Delta::Other => {}
            },
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = &usage {
                    self.collector.record(usage);
                }
                if let Some(reason) = delta.stop_reason.as_deref() {
                    out.push(self.chunk(
                        ResponseMessage::default(),
                        Some(stop_reason_to_finish_reason(reason)),
                    ));
                }
            }
            ClaudeStreamEvent::MessageStop => self.finished = true,
            ClaudeStreamEvent::Error { error } => {
                return Err(Error::Upstream {
                    status: status_for_error_type(&error.error_type),
                    error_type: error.error_type,
                    message: error.message,
                });
            }
            ClaudeStreamEvent::Completion {
                completion,
                stop_reason,
                model,
            } => {
                if !model.is_empty() {
                    self.model = model;
                }
                out.push(self.chunk(
                    ResponseMessage {
                        content: Some(completion),
                        ..Default::default()
                    },
                    stop_reason.as_deref().map(stop_reason_to_finish_reason),
                ));
                if stop_reason.is_some() {
                    self.finished = true;
                }
            }
            ClaudeStreamEvent::ContentBlockStop { .. }
            | ClaudeStreamEvent::Ping
            | ClaudeStreamEvent::Unknown => {}
        }

        Ok(out)
    }
}

async fn forward(sink: &ClientSink, frames: Vec<ClientFrame>) -> Result<(), Error> {
    for frame in frames {
        sink.send(frame).await.map_err(|_| Error::Cancelled)?;
    }
    Ok(())
}

async fn stream_handler(
    response: Response,
    info: &RelayInfo,
    sink: &ClientSink,
    idle_timeout: Duration,
) -> NormalizedResult {
    let mut body = Box::pin(response.bytes_stream());
    let mut sse = SseBuffer::new();
    let mut state = StreamState::new(info);

    while !state.finished {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => {
                info!("[{}] client disconnected, aborting upstream stream", info.request_id);
                return NormalizedResult::partial(&state.collector, Error::Cancelled);
            }
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return NormalizedResult::partial(&state.collector, Error::StreamTimeout(idle_timeout))
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return NormalizedResult::partial(&state.collector, Error::Http(e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let frames = match sse.push(&chunk) {
            Ok(frames) => frames,
            Err(msg) => {
                return NormalizedResult::partial(&state.collector, Error::MalformedResponse(msg))
            }
        };

        for frame in &frames {
            let out = match state.handle(frame) {
                Ok(out) => out,
                Err(e) => return NormalizedResult::partial(&state.collector, e),
            };
            if let Err(e) = forward(sink, out).await {
                return NormalizedResult::partial(&state.collector, e);
            }
            if state.finished {
                break;
            }
        }
    }

    if !state.finished {
        match sse.finish() {
            Ok(Some(frame)) => {
                let out = match state.handle(&frame) {
                    Ok(out) => out,
                    Err(e) => return NormalizedResult::partial(&state.collector, e),
                };
                if let Err(e) = forward(sink, out).await {
                    return NormalizedResult::partial(&state.collector, e);
                }
            }
            Ok(None) => {}
            Err(msg) => {
                return NormalizedResult::partial(&state.collector, Error::MalformedResponse(msg))
            }
        }
    }

    if !state.finished {
        return NormalizedResult::partial(
            &state.collector,
            Error::MalformedResponse("upstream stream ended before message_stop".into()),
        );
    }

    if sink.send(ClientFrame::Done).await.is_err() {
        return NormalizedResult::partial(&state.collector, Error::Cancelled);
    }

    if !state.collector.has_usage() {
        warn!("[{}] stream carried no usage, reporting zero tokens", info.request_id);
    }
    NormalizedResult::success(state.collector.usage())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::models::GeneralOpenAIRequest;

    fn state() -> StreamState {
        let request = GeneralOpenAIRequest {
            model: "claude-sonnet-4-20250514".into(),
            stream: Some(true),
            ..Default::default()
        };
        StreamState::new(&RelayInfo::new(&ChannelConfig::default(), &request))
    }

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    fn chunk_of(frames: &[ClientFrame]) -> &ChatCompletionChunk {
        match &frames[0] {
            ClientFrame::Chunk(chunk) => chunk,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn tool_use_events_become_tool_call_deltas() {
        let mut state = state();
        state
            .handle(&frame(r#"{"type":"message_start","message":{"id":"msg_1","model":"m","usage":{"input_tokens":7}}}"#))
            .unwrap();
        state
            .handle(&frame(r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#))
            .unwrap();

        let start = state
            .handle(&frame(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"lookup","input":{}}}"#))
            .unwrap();
        let call = &chunk_of(&start).choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, Some(0));
        assert_eq!(call.id.as_deref(), Some("toolu_1"));
        assert_eq!(call.function.name.as_deref(), Some("lookup"));

        let delta = state
            .handle(&frame(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#))
            .unwrap();
        let call = &chunk_of(&delta).choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, Some(0));
        assert_eq!(call.function.arguments, "{\"q\":");

        let stop = state
            .handle(&frame(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}"#))
            .unwrap();
        assert_eq!(chunk_of(&stop).choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(chunk_of(&stop).id, "msg_1");

        state.handle(&frame(r#"{"type":"message_stop"}"#)).unwrap();
        assert!(state.finished);
        assert_eq!(state.collector.usage(), Usage::new(7, 12));
    }

    #[test]
    fn error_event_maps_to_upstream_error() {
        let mut state = state();
        let err = state
            .handle(&frame(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#))
            .unwrap_err();
        match err {
            Error::Upstream { status, error_type, message } => {
                assert_eq!(status, 529);
                assert_eq!(error_type, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn unknown_events_are_skipped_and_garbage_is_malformed() {
        let mut state = state();
        assert!(state
            .handle(&frame(r#"{"type":"some_future_event","x":1}"#))
            .unwrap()
            .is_empty());
        assert!(matches!(
            state.handle(&frame("{not json")),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn done_marker_does_not_end_a_claude_stream() {
        let mut state = state();
        assert!(state.handle(&frame("[DONE]")).unwrap().is_empty());
        assert!(!state.finished);
        assert!(!state.collector.has_usage());
    }

    #[test]
    fn json_delta_without_tool_start_is_dropped() {
        let mut state = state();
        let out = state
            .handle(&frame(r#"{"type":"content_block_delta","index":3,"delta":{"type":"input_json_delta","partial_json":"{\"q\""}}"#))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn legacy_completion_events_finish_on_stop_reason() {
        let mut state = state();
        let out = state
            .handle(&frame(r#"{"type":"completion","completion":" Hi","stop_reason":null,"model":"claude-2.1"}"#))
            .unwrap();
        assert_eq!(chunk_of(&out).choices[0].delta.content.as_deref(), Some(" Hi"));
        assert!(!state.finished);

        let out = state
            .handle(&frame(r#"{"type":"completion","completion":"","stop_reason":"stop_sequence","model":"claude-2.1"}"#))
            .unwrap();
        assert_eq!(chunk_of(&out).choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(state.finished);
    }
}
