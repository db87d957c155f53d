use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use crate::error::Result;

/// 中转网关的主配置结构
/// 包含服务器、上游传输和渠道三部分
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    pub server: ServerConfig,
    /// 上游HTTP传输配置，所有渠道共享
    #[serde(default)]
    pub transport: TransportConfig,
    /// 渠道列表，每个渠道对应一个 adaptor 实例
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为8080
    pub port: u16,
}

/// 上游传输配置
/// 对应共享的 reqwest 客户端，由所有渠道复用
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// 整体请求超时（humantime格式，如 "600s"）
    /// 不配置表示不限制，便于长时间的SSE流
    #[serde(with = "humantime_serde", default)]
    pub relay_timeout: Option<Duration>,
    /// 流式响应两个chunk之间允许的最长空闲时间
    #[serde(with = "humantime_serde", default = "default_stream_idle_timeout")]
    pub stream_idle_timeout: Duration,
    /// 每个host最大空闲连接数
    pub max_idle_per_host: usize,
    /// 是否启用TCP Keep-Alive
    pub keep_alive: bool,
}

fn default_stream_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

/// 渠道配置
/// 渠道的模式在加载时确定一次，之后所有请求只读
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// 渠道ID
    pub id: u64,
    /// 渠道名称，仅用于日志
    pub name: String,
    /// 上游基础URL，例如 "https://api.anthropic.com"
    pub base_url: String,
    /// 上游API密钥
    pub api_key: String,
    /// 请求模式："message"（默认）或 "complete"
    #[serde(default)]
    pub mode: Option<String>,
    /// 该渠道使用的代理，例如 "http://127.0.0.1:7890"
    #[serde(default)]
    pub proxy: Option<String>,
    /// 该渠道服务的模型，为空时使用 adaptor 自带的模型列表
    #[serde(default)]
    pub models: Vec<String>,
    /// 模型名映射：客户端模型名 -> 上游模型名
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// 1. 首先从指定文件加载配置
    /// 2. 然后从环境变量覆盖配置（前缀为RELAY，分隔符为__）
    ///    例如：RELAY__SERVER__PORT=8081 会覆盖 server.port
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    /// 创建默认配置
    ///
    /// - 服务器：监听 0.0.0.0:8080
    /// - 传输：不限制整体超时，流空闲超时5分钟，每host 100个空闲连接
    /// - 渠道：无
    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            transport: TransportConfig::default(),
            channels: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_timeout: None,
            stream_idle_timeout: default_stream_idle_timeout(),
            max_idle_per_host: 100,
            keep_alive: true,
        }
    }
}
