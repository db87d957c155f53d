use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Request, Response, StatusCode},
    routing::{get, post},
    Router as AxumRouter,
};
use claude_code_relay::{
    config::Config,
    error::Error,
    models::{GeneralOpenAIRequest, RelayInfo},
    protocol::{claude_code::ClaudeCodeAdaptor, Adaptor, ClientFrame, NormalizedResult},
    proxy::Transport,
    router::Router,
    Result,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 客户端帧缓冲，满了以后反压上游读取
const CLIENT_FRAME_BUFFER: usize = 64;

#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
    transport: Arc<Transport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，支持通过环境变量配置，默认info级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Claude Code relay...");

    // 加载配置
    let config = Config::from_file("config.yaml").unwrap_or_else(|e| {
        info!("Failed to load config.yaml ({}), using default config", e);
        Config::default()
    });

    // 渠道在这里一次性初始化，请求期间只读
    let router = Arc::new(Router::new(&config.channels, &config.transport)?);
    if router.is_empty() {
        warn!("No channels configured, every relay request will fail");
    }
    let transport = Arc::new(Transport::new(config.transport.clone())?);

    let state = AppState { router, transport };

    let app = AxumRouter::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(handle_chat))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Response<Body> {
    json_response(StatusCode::OK, serde_json::json!({ "status": "healthy" }))
}

async fn handle_chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response<Body> {
    let request: GeneralOpenAIRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&Error::InvalidInput(format!("invalid request body: {}", e)));
        }
    };

    let channels = state.router.select(&request.model);
    if channels.is_empty() {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": {
                    "message": format!("no available channel for model {}", request.model),
                    "type": "gateway_error",
                }
            }),
        );
    }

    let inbound = filter_client_headers(&headers);
    let mut last_error = None;

    for channel in channels {
        let info = RelayInfo::new(&channel.config, &request);
        let adaptor = channel.adaptor.clone();

        info!(
            "[{}] relay -> channel {} ({}), model: {} -> {}, stream: {}",
            info.request_id,
            info.channel_id,
            adaptor.channel_name(),
            info.origin_model,
            info.upstream_model,
            info.is_stream
        );

        // 转换和请求头错误在任何网络IO之前返回
        let converted = match adaptor.convert_request(&info, Some(&request)) {
            Ok(converted) => converted,
            Err(e) => return error_response(&e),
        };

        let response = match adaptor
            .do_request(&state.transport, &inbound, &info, &converted)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_retryable() => {
                warn!(
                    "[{}] channel {} transport failure: {}, trying next channel",
                    info.request_id, info.channel_id, e
                );
                last_error = Some(e);
                continue;
            }
            Err(e) => return error_response(&e),
        };

        return relay_response(adaptor, response, info).await;
    }

    match last_error {
        Some(e) => error_response(&e),
        None => error_response(&Error::Unsupported("no channel could serve the request".into())),
    }
}

/// 在后台任务中解码上游响应，第一帧决定回复 JSON 还是 SSE
async fn relay_response(
    adaptor: Arc<ClaudeCodeAdaptor>,
    response: reqwest::Response,
    info: RelayInfo,
) -> Response<Body> {
    let (tx, mut rx) = mpsc::channel::<ClientFrame>(CLIENT_FRAME_BUFFER);

    tokio::spawn(async move {
        let result = adaptor.do_response(response, &info, &tx).await;
        report_usage(&info, &result);
        if let Some(e) = &result.error {
            // 客户端已断开时发送失败，忽略
            let _ = tx.send(ClientFrame::from_error(e)).await;
        }
    });

    let first = match rx.recv().await {
        Some(frame) => frame,
        None => {
            return error_response(&Error::MalformedResponse(
                "upstream finished without any response".into(),
            ))
        }
    };

    match first {
        ClientFrame::Body(body) => match serde_json::to_value(&body) {
            Ok(value) => json_response(StatusCode::OK, value),
            Err(e) => error_response(&Error::Serialization(e)),
        },
        ClientFrame::Error { status, body } => json_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        ),
        first => {
            // 接收端随响应体一起被丢弃，后台解码随之取消
            let stream = async_stream::stream! {
                yield Ok::<_, std::convert::Infallible>(sse_bytes(&first));
                while let Some(frame) = rx.recv().await {
                    yield Ok(sse_bytes(&frame));
                }
            };

            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    }
}

fn sse_bytes(frame: &ClientFrame) -> Bytes {
    let data = match frame {
        ClientFrame::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
        ClientFrame::Body(body) => serde_json::to_string(body).unwrap_or_default(),
        ClientFrame::Error { body, .. } => body.to_string(),
        ClientFrame::Done => "[DONE]".to_string(),
    };
    Bytes::from(format!("data: {}\n\n", data))
}

/// 用量交给计费，这里只记录日志
fn report_usage(info: &RelayInfo, result: &NormalizedResult) {
    match (&result.usage, &result.error) {
        (Some(usage), None) => info!(
            "[{}] usage - channel: {}, model: {}, input: {}, output: {}, cache_read: {}, cache_creation: {}, elapsed: {:?}",
            info.request_id,
            info.channel_id,
            info.upstream_model,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.cache_read_tokens,
            usage.cache_creation_tokens,
            info.start_time.elapsed()
        ),
        (usage, Some(e)) => error!(
            "[{}] relay failed - channel: {}, model: {}, partial usage: {:?}, error: {}",
            info.request_id, info.channel_id, info.upstream_model, usage, e
        ),
        (None, None) => {}
    }
}

fn filter_client_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut filtered = reqwest::header::HeaderMap::new();

    // 只有这些客户端头会影响上游请求，其余全部丢弃
    let forwarded_headers = ["content-type", "accept", "anthropic-version"];

    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_lowercase();
        if forwarded_headers.contains(&name_str.as_str()) {
            // 将axum的HeaderName/HeaderValue转换为reqwest的类型
            if let Ok(reqwest_name) =
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            {
                if let Ok(reqwest_value) =
                    reqwest::header::HeaderValue::from_bytes(value.as_bytes())
                {
                    filtered.insert(reqwest_name, reqwest_value);
                }
            }
        }
    }

    filtered
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(error: &Error) -> Response<Body> {
    json_response(
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY),
        error.to_openai_error(),
    )
}
