use crate::config::TransportConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{header::HeaderMap, Client, Proxy, Response};
use std::time::Duration;
use tracing::{debug, error, info};

/// 上游HTTP传输层，进程内共享
///
/// adaptor 不自己创建客户端，每次请求都从这里取
pub struct Transport {
    client: Client,
    // 按代理地址缓存的客户端，复用连接池
    proxied: DashMap<String, Client>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Self::builder(&config).build().map_err(Error::Http)?;

        Ok(Self {
            client,
            proxied: DashMap::new(),
            config,
        })
    }

    fn builder(config: &TransportConfig) -> reqwest::ClientBuilder {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(if config.keep_alive {
                Some(Duration::from_secs(30))
            } else {
                None
            });

        // 不配置超时则不限制，长时间的SSE流靠空闲超时兜底
        if let Some(timeout) = config.relay_timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// 根据渠道代理取客户端
    /// 代理地址无法解析时记录错误并退回共享客户端
    pub fn client_for(&self, proxy: Option<&str>) -> Client {
        let proxy_url = match proxy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(url) => url,
            None => return self.client.clone(),
        };

        if let Some(client) = self.proxied.get(proxy_url) {
            return client.clone();
        }

        let built = Proxy::all(proxy_url)
            .and_then(|p| Self::builder(&self.config).proxy(p).build());

        match built {
            Ok(client) => {
                info!("Created proxied client for {}", proxy_url);
                self.proxied
                    .entry(proxy_url.to_string())
                    .or_insert(client)
                    .clone()
            }
            Err(e) => {
                error!("Failed to build client for proxy {}: {}", proxy_url, e);
                self.client.clone()
            }
        }
    }

    /// 发送已缓冲的请求体
    pub async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        proxy: Option<&str>,
    ) -> Result<Response> {
        debug!("post: {} ({} bytes)", url, body.len());

        let response = self
            .client_for(proxy)
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::Http(e)
            })?;

        debug!("post: upstream answered with status {}", response.status());
        Ok(response)
    }
}
