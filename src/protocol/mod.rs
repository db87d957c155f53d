pub mod anthropic;
pub mod claude_code;
pub mod convert;
pub mod detector;
pub mod headers;
pub mod response;

use crate::error::Result;
use crate::models::{AudioRequest, GeneralOpenAIRequest, ImageRequest, RelayInfo, RerankRequest};
use crate::proxy::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Response;
use serde::Serialize;
use serde_json::Value;

pub use response::{ClientFrame, ClientSink, NormalizedResult};

/// 上游渠道适配器
///
/// 每个渠道创建一个实例，被该渠道的所有并发请求共享，
/// 因此实现里不能有按请求修改的状态。
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// 上游请求体，每种上游格式一个变体
    type Request: Serialize + Send + Sync;

    /// 上游完整URL
    fn request_url(&self, info: &RelayInfo) -> String;

    /// 上游请求头
    fn setup_request_header(&self, inbound: &HeaderMap, info: &RelayInfo) -> Result<HeaderMap>;

    /// 统一请求 -> 上游请求，`None` 返回 `InvalidInput`
    fn convert_request(
        &self,
        info: &RelayInfo,
        request: Option<&GeneralOpenAIRequest>,
    ) -> Result<Self::Request>;

    fn convert_image_request(&self, info: &RelayInfo, request: &ImageRequest) -> Result<Value>;

    fn convert_audio_request(&self, info: &RelayInfo, request: &AudioRequest) -> Result<Bytes>;

    fn convert_rerank_request(&self, info: &RelayInfo, request: &RerankRequest) -> Result<Value>;

    /// 发送请求，请求体先完整缓冲
    async fn do_request(
        &self,
        transport: &Transport,
        inbound: &HeaderMap,
        info: &RelayInfo,
        request: &Self::Request,
    ) -> Result<Response>;

    /// 解码上游响应，转发给客户端并返回用量
    async fn do_response(
        &self,
        response: Response,
        info: &RelayInfo,
        sink: &ClientSink,
    ) -> NormalizedResult;

    fn model_list(&self) -> &'static [&'static str];

    fn channel_name(&self) -> &'static str;
}
