// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! HTTP 接口 (axum)
//!
//! 路由层只做转发: 推流 / 检测 / 摄像头状态 / 事件查询.
//! 会阻塞的调用 (启动摄像头、等待线程退出、读事件日志) 放进 `spawn_blocking`.

use std::future::Future;
use std::sync::Arc;
use std::thread;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::services::AppServices;
use crate::streaming::mjpeg;

type AppState = Arc<AppServices>;

const DEFAULT_EVENT_LIMIT: usize = 20;
const MAX_EVENT_LIMIT: usize = 500;

/// 控制接口统一响应
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

fn status_code(e: &Error) -> StatusCode {
    match e {
        Error::NotActive(_) | Error::Hardware(_) | Error::NotInitialized => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::OverCapacity(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> Response {
    (status_code(e), Json(ApiResponse::failed(e.to_string()))).into_response()
}

fn control(result: Result<()>, message: &str) -> Response {
    match result {
        Ok(()) => Json(ApiResponse::done(message)).into_response(),
        Err(e) => {
            warn!("⚠️ {} 失败: {}", message, e);
            error_response(&e)
        }
    }
}

/// 在阻塞线程池中执行
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(Error::Io(std::io::Error::other(e.to_string()))))
}

pub fn router(services: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stream", get(stream))
        .route("/api/stream/status", get(stream_status))
        .route("/api/stream/start", post(stream_start))
        .route("/api/stream/stop", post(stream_stop))
        .route("/api/detection/status", get(detection_status))
        .route("/api/detection/start", post(detection_start))
        .route("/api/detection/stop", post(detection_stop))
        .route("/api/camera/status", get(camera_status))
        .route("/api/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

/// 启动 HTTP 服务, `shutdown` 完成后优雅退出
pub async fn serve(
    services: AppState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_on(services, listener, shutdown).await
}

/// 在已绑定的监听器上服务
///
/// 收到 `shutdown` 后先关闭推流, 观看者线程在下一帧结束, 连接随之排空.
pub async fn serve_on(
    services: AppState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("🌐 HTTP 服务监听 http://{}", listener.local_addr()?);
    info!("📺 实时画面: http://{}/stream", listener.local_addr()?);

    let streaming = Arc::clone(&services);
    let drain = async move {
        shutdown.await;
        streaming.streaming.stop_streaming();
    };

    axum::serve(listener, router(services))
        .with_graceful_shutdown(drain)
        .await?;
    info!("🌐 HTTP 服务已退出");
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// MJPEG 实时画面, 每个观看者一个线程
async fn stream(State(services): State<AppState>) -> Response {
    let parts = match services.streaming.create_stream() {
        Ok(parts) => parts,
        Err(e) => return error_response(&e),
    };

    let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(2);
    let spawned = thread::Builder::new()
        .name("mjpeg-viewer".into())
        .spawn(move || {
            for part in parts {
                // 客户端断开
                if tx.blocking_send(Ok(part)).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        return error_response(&Error::Io(e));
    }

    (
        [
            (header::CONTENT_TYPE, mjpeg::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn stream_status(State(services): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok("ok", services.streaming.get_status()))
}

async fn stream_start(State(services): State<AppState>) -> Response {
    let result = blocking(move || services.streaming.start_streaming()).await;
    control(result, "推流已开启")
}

async fn stream_stop(State(services): State<AppState>) -> Response {
    services.streaming.stop_streaming();
    control(Ok(()), "推流已关闭")
}

async fn detection_status(State(services): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok("ok", services.detection.get_status()))
}

async fn detection_start(State(services): State<AppState>) -> Response {
    let result = blocking(move || services.detection.start()).await;
    control(result, "检测已启动")
}

async fn detection_stop(State(services): State<AppState>) -> Response {
    let result = blocking(move || services.detection.stop()).await;
    control(result, "检测已停止")
}

async fn camera_status(State(services): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok("ok", services.camera.get_status()))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn events(State(services): State<AppState>, Query(query): Query<EventsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    match blocking(move || services.sink.recent_events(limit)).await {
        Ok(events) => Json(ApiResponse::ok(format!("{} 条事件", events.len()), events)).into_response(),
        Err(e) => error_response(&e),
    }
}
