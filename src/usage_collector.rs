use crate::models::Usage;
use crate::protocol::anthropic;
use tracing::debug;

/// 单个缓冲区上限，超过说明上游没有按SSE分帧
const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// 一个完整的SSE事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// SSE 分帧缓冲
///
/// 上游的一个chunk可能包含半个事件，也可能包含多个事件，
/// 这里累积字节直到遇到空行再切出完整事件。
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
    // 已确认不含分隔符的前缀长度，下次从这里继续查找
    scanned: usize,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个chunk，返回其中所有完整的事件（按到达顺序）
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buffer, self.scanned) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            self.scanned = 0;
            if let Some(frame) = parse_frame(&raw[..end]) {
                frames.push(frame);
            }
        }
        // 分隔符最长4字节，末尾3字节可能是半个分隔符
        self.scanned = self.buffer.len().saturating_sub(3);

        if self.buffer.len() > MAX_BUFFER_BYTES {
            let len = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(format!("SSE event exceeds {} bytes (buffered {})", MAX_BUFFER_BYTES, len));
        }

        Ok(frames)
    }

    /// 流结束时调用：剩余内容若能组成事件则返回，
    /// 只剩半截数据时返回 Err，表示上游流被截断
    pub fn finish(&mut self) -> Result<Option<SseFrame>, String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }

        match parse_frame(&rest) {
            Some(frame) if serde_json::from_str::<serde_json::Value>(&frame.data).is_ok() => {
                Ok(Some(frame))
            }
            _ => Err(format!(
                "truncated SSE event: {}",
                String::from_utf8_lossy(&rest[..rest.len().min(256)])
            )),
        }
    }
}

/// 从 `from` 开始查找事件分隔符 \n\n 或 \r\n\r\n
fn find_frame_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    for i in from..buf.len() {
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
    }
    None
}

/// 解析SSE事件的字段，多行data按规范用换行拼接
fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id: / retry: / 注释行忽略
    }

    // 没有data字段，跳过
    if data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// 流式响应的Usage收集器
///
/// 每个请求一个，随解码器一起创建和销毁
#[derive(Debug, Default)]
pub struct StreamUsageCollector {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    cache_read_tokens: u32,
    cache_creation_tokens: u32,
}

impl StreamUsageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// message_start 携带 input_tokens，message_delta 携带累计的 output_tokens，
    /// 同一个字段后到的值覆盖先到的值
    pub fn record(&mut self, usage: &anthropic::Usage) {
        if usage.input_tokens > 0 {
            self.input_tokens = Some(usage.input_tokens);
        }
        if usage.output_tokens > 0 || self.output_tokens.is_none() {
            self.output_tokens = Some(usage.output_tokens);
        }
        if usage.cache_read_input_tokens > 0 {
            self.cache_read_tokens = usage.cache_read_input_tokens;
        }
        if usage.cache_creation_input_tokens > 0 {
            self.cache_creation_tokens = usage.cache_creation_input_tokens;
        }

        debug!(
            "Usage Collector - input={:?}, output={:?}",
            self.input_tokens, self.output_tokens
        );
    }

    pub fn has_usage(&self) -> bool {
        self.input_tokens.is_some() || self.output_tokens.is_some()
    }

    pub fn usage(&self) -> Usage {
        Usage {
            cache_read_tokens: self.cache_read_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            ..Usage::new(
                self.input_tokens.unwrap_or(0),
                self.output_tokens.unwrap_or(0),
            )
        }
    }
}
