use crate::config::{ChannelConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::protocol::claude_code::ClaudeCodeAdaptor;
use crate::protocol::Adaptor;
use std::sync::Arc;
use tracing::info;

/// 一个已初始化的渠道
pub struct Channel {
    pub config: ChannelConfig,
    pub adaptor: Arc<ClaudeCodeAdaptor>,
}

impl Channel {
    pub fn serves(&self, model: &str) -> bool {
        if self.config.models.is_empty() {
            self.adaptor.model_list().contains(&model)
                || self.config.model_mapping.contains_key(model)
        } else {
            self.config.models.iter().any(|m| m == model)
        }
    }
}

/// 渠道路由
///
/// 在加载配置时为每个渠道创建一次 adaptor，之后只读
pub struct Router {
    channels: Vec<Channel>,
}

impl Router {
    pub fn new(channels: &[ChannelConfig], transport: &TransportConfig) -> Result<Self> {
        let mut built = Vec::with_capacity(channels.len());

        for config in channels {
            if config.base_url.is_empty() {
                return Err(Error::Config(format!("channel {} has no base_url", config.name)));
            }

            let adaptor = ClaudeCodeAdaptor::new(config)
                .with_stream_idle_timeout(transport.stream_idle_timeout);
            info!(
                "Channel {} ({}) initialized in {:?} mode",
                config.id,
                config.name,
                adaptor.mode()
            );

            built.push(Channel {
                config: config.clone(),
                adaptor: Arc::new(adaptor),
            });
        }

        Ok(Self { channels: built })
    }

    /// 按配置顺序返回能服务该模型的渠道
    pub fn select(&self, model: &str) -> Vec<&Channel> {
        self.channels.iter().filter(|c| c.serves(model)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::claude_code::RequestMode;

    fn channel(id: u64, models: &[&str], mode: Option<&str>) -> ChannelConfig {
        ChannelConfig {
            id,
            name: format!("cc-{}", id),
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk".into(),
            mode: mode.map(str::to_string),
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn selects_channels_in_order() {
        let router = Router::new(
            &[
                channel(1, &["claude-opus-4-20250514"], None),
                channel(2, &[], Some("complete")),
                channel(3, &["claude-sonnet-4-20250514"], None),
            ],
            &TransportConfig::default(),
        )
        .unwrap();

        let ids: Vec<_> = router
            .select("claude-sonnet-4-20250514")
            .iter()
            .map(|c| c.config.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);

        assert_eq!(router.select("claude-sonnet-4-20250514")[0].adaptor.mode(), RequestMode::Completion);
        assert!(router.select("gpt-4o").is_empty());
    }

    #[test]
    fn rejects_channel_without_base_url() {
        let mut config = channel(1, &[], None);
        config.base_url.clear();
        assert!(Router::new(&[config], &TransportConfig::default()).is_err());
    }
}
