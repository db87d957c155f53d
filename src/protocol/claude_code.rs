use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::models::{AudioRequest, GeneralOpenAIRequest, ImageRequest, RelayInfo, RerankRequest};
use crate::protocol::anthropic::ClaudeRequest;
use crate::protocol::convert::{request_openai_to_claude_complete, request_openai_to_claude_message};
use crate::protocol::headers::build_claude_code_headers;
use crate::protocol::response::{self, ClientSink, NormalizedResult};
use crate::protocol::Adaptor;
use crate::proxy::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Response;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub const CHANNEL_NAME: &str = "claude_code";

pub const MODEL_LIST: &[&str] = &[
    "claude-3-5-haiku-20241022",
    "claude-3-5-sonnet-20241022",
    "claude-3-7-sonnet-20250219",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
    "claude-opus-4-1-20250805",
];

const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// 请求日志里请求体的最大长度
const REQUEST_LOG_PREVIEW: usize = 2048;

/// 上游请求格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// 旧版 /v1/complete
    Completion,
    /// /v1/messages
    Message,
}

impl RequestMode {
    /// 从渠道配置解析，无法识别时退回 Message
    pub fn from_config(mode: Option<&str>) -> Self {
        match mode.map(|m| m.trim().to_ascii_lowercase()) {
            None => RequestMode::Message,
            Some(m) => match m.as_str() {
                "" | "message" | "messages" | "current" => RequestMode::Message,
                "complete" | "completion" | "legacy" => RequestMode::Completion,
                other => {
                    warn!("Unknown claude code request mode {:?}, falling back to message", other);
                    RequestMode::Message
                }
            },
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            RequestMode::Message => "/v1/messages?beta=true",
            RequestMode::Completion => "/v1/complete",
        }
    }
}

/// Claude Code 渠道适配器
///
/// 模式在构造时由渠道配置决定，之后只读。
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdaptor {
    mode: RequestMode,
    stream_idle_timeout: Duration,
}

impl ClaudeCodeAdaptor {
    pub fn new(channel: &ChannelConfig) -> Self {
        Self {
            mode: RequestMode::from_config(channel.mode.as_deref()),
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }
}

#[async_trait]
impl Adaptor for ClaudeCodeAdaptor {
    type Request = ClaudeRequest;

    fn request_url(&self, info: &RelayInfo) -> String {
        let base_url = info.base_url.trim_end_matches('/');
        // 已经带 /v1 的 base_url 不再重复
        let base_url = base_url.strip_suffix("/v1").unwrap_or(base_url);
        format!("{}{}", base_url, self.mode.path())
    }

    fn setup_request_header(&self, inbound: &HeaderMap, info: &RelayInfo) -> Result<HeaderMap> {
        build_claude_code_headers(inbound, info)
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: Option<&GeneralOpenAIRequest>,
    ) -> Result<ClaudeRequest> {
        let request = request.ok_or_else(|| Error::InvalidInput("request is nil".into()))?;

        Ok(match self.mode {
            RequestMode::Completion => {
                ClaudeRequest::Complete(request_openai_to_claude_complete(request, &info.upstream_model))
            }
            RequestMode::Message => {
                ClaudeRequest::Message(request_openai_to_claude_message(request, &info.upstream_model))
            }
        })
    }

    fn convert_image_request(&self, _info: &RelayInfo, _request: &ImageRequest) -> Result<Value> {
        Err(Error::Unsupported("claude code channel does not support image generation".into()))
    }

    fn convert_audio_request(&self, _info: &RelayInfo, _request: &AudioRequest) -> Result<Bytes> {
        Err(Error::Unsupported("claude code channel does not support audio".into()))
    }

    fn convert_rerank_request(&self, _info: &RelayInfo, _request: &RerankRequest) -> Result<Value> {
        Err(Error::Unsupported("claude code channel does not support rerank".into()))
    }

    async fn do_request(
        &self,
        transport: &Transport,
        inbound: &HeaderMap,
        info: &RelayInfo,
        request: &ClaudeRequest,
    ) -> Result<Response> {
        // 请求体完整缓冲后再发送
        let body = Bytes::from(serde_json::to_vec(request)?);
        debug!(
            "[ClaudeCode] request {} body ({} bytes): {}",
            info.request_id,
            body.len(),
            String::from_utf8_lossy(&body[..body.len().min(REQUEST_LOG_PREVIEW)])
        );

        let url = self.request_url(info);
        let headers = self.setup_request_header(inbound, info)?;
        transport
            .post(&url, headers, body, info.proxy.as_deref())
            .await
    }

    async fn do_response(
        &self,
        response: Response,
        info: &RelayInfo,
        sink: &ClientSink,
    ) -> NormalizedResult {
        let result = response::normalize(response, info, self.mode, sink, self.stream_idle_timeout).await;
        debug!(
            "[ClaudeCode] request {} finished, error: {:?}",
            info.request_id, result.error
        );
        result
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODEL_LIST
    }

    fn channel_name(&self) -> &'static str {
        CHANNEL_NAME
    }
}
