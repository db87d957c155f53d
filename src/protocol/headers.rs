use crate::error::{Error, Result};
use crate::models::RelayInfo;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

/// 客户端未指定时使用的 anthropic-version
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// 官方 Claude Code CLI 的请求头指纹
/// 每个请求都原样发送，不能随请求内容变化
pub const CLAUDE_CODE_FINGERPRINT: &[(&str, &str)] = &[
    ("x-stainless-retry-count", "0"),
    ("x-stainless-timeout", "600"),
    ("x-stainless-lang", "js"),
    ("x-stainless-package-version", "0.55.1"),
    ("x-stainless-os", "MacOS"),
    ("x-stainless-arch", "arm64"),
    ("x-stainless-runtime", "node"),
    ("x-stainless-helper-method", "stream"),
    ("x-app", "cli"),
    ("user-agent", "claude-cli/1.0.44 (external, cli)"),
    ("anthropic-beta", "fine-grained-tool-streaming-2025-05-14"),
    ("x-stainless-runtime-version", "v20.18.1"),
    ("anthropic-dangerous-direct-browser-access", "true"),
];

/// 构造发往 Claude 上游的请求头
///
/// 顺序：通用头 -> 认证 -> 版本 -> 指纹。指纹最后写入，覆盖客户端同名头。
pub fn build_claude_code_headers(inbound: &HeaderMap, info: &RelayInfo) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    headers.insert(
        CONTENT_TYPE,
        inbound
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    match inbound.get(ACCEPT) {
        Some(accept) => {
            headers.insert(ACCEPT, accept.clone());
        }
        None if info.is_stream => {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        None => {}
    }

    headers.insert(
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_str(&info.api_key)
            .map_err(|_| Error::InvalidInput("Invalid api key format".into()))?,
    );

    let version = inbound
        .get("anthropic-version")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION));
    headers.insert(HeaderName::from_static("anthropic-version"), version);

    for &(name, value) in CLAUDE_CODE_FINGERPRINT {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::models::GeneralOpenAIRequest;

    fn info(stream: bool) -> RelayInfo {
        let channel = ChannelConfig {
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk-ant-test".into(),
            ..Default::default()
        };
        let request = GeneralOpenAIRequest {
            model: "claude-sonnet-4-20250514".into(),
            stream: Some(stream),
            ..Default::default()
        };
        RelayInfo::new(&channel, &request)
    }

    fn assert_fingerprint(headers: &HeaderMap) {
        for &(name, value) in CLAUDE_CODE_FINGERPRINT {
            let all: Vec<_> = headers.get_all(name).iter().collect();
            assert_eq!(all.len(), 1, "header {} should appear once", name);
            assert_eq!(all[0].as_bytes(), value.as_bytes(), "header {}", name);
        }
    }

    #[test]
    fn fingerprint_is_identical_across_inbound_headers() {
        let empty = build_claude_code_headers(&HeaderMap::new(), &info(false)).unwrap();
        assert_fingerprint(&empty);

        let mut noisy = HeaderMap::new();
        noisy.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        noisy.insert("x-stainless-os", HeaderValue::from_static("Linux"));
        noisy.insert("anthropic-beta", HeaderValue::from_static("something-else"));
        let overridden = build_claude_code_headers(&noisy, &info(true)).unwrap();
        assert_fingerprint(&overridden);
    }

    #[test]
    fn auth_and_default_version() {
        let headers = build_claude_code_headers(&HeaderMap::new(), &info(false)).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
        assert_eq!(headers.get("anthropic-version").unwrap(), DEFAULT_ANTHROPIC_VERSION);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(headers.get(ACCEPT).is_none());
    }

    #[test]
    fn client_version_is_kept() {
        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        let headers = build_claude_code_headers(&inbound, &info(false)).unwrap();
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-01-01");
    }

    #[test]
    fn stream_requests_accept_event_stream() {
        let headers = build_claude_code_headers(&HeaderMap::new(), &info(true)).unwrap();
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/event-stream");
    }

    #[test]
    fn invalid_api_key_fails_before_io() {
        let mut relay = info(false);
        relay.api_key = "bad\nkey".into();
        let err = build_claude_code_headers(&HeaderMap::new(), &relay).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
