use crate::models::RelayInfo;
use reqwest::header::{HeaderMap, CONTENT_TYPE};

/// 响应解码路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    /// 按SSE事件逐个解码
    Stream,
    /// 一次读完整个body再解码
    Sync,
}

pub struct StreamDetector;

impl StreamDetector {
    // 判断上游是否返回了SSE
    pub fn is_event_stream(headers: &HeaderMap) -> bool {
        headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }

    /// 选择解码路径
    ///
    /// 优先级：上游的 text/event-stream 高于客户端声明的 stream 参数。
    /// 上游可能在客户端没要求时也返回流，此时必须按流解码。
    pub fn decode_path(headers: &HeaderMap, info: &RelayInfo) -> DecodePath {
        if Self::is_event_stream(headers) {
            return DecodePath::Stream;
        }
        if info.is_stream {
            return DecodePath::Stream;
        }
        DecodePath::Sync
    }
}
