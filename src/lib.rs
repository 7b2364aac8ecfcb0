// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod camera; // 摄像头采集与最新帧
pub mod config; // 服务配置 (JSON)
pub mod detection; // 目标检测与检测循环
pub mod error;
pub mod events; // 进入/离开事件
pub mod server; // HTTP 接口
pub mod services; // 服务装配
pub mod streaming; // MJPEG 推流
pub mod telemetry; // 日志
pub mod worker; // 后台线程

#[cfg(test)]
mod testing;

pub use crate::camera::{CameraService, Frame, FrameSource};
pub use crate::config::AppConfig;
pub use crate::detection::{DetectionLoop, Detector};
pub use crate::error::{Error, Result};
pub use crate::events::{EventSink, EventTracker, EventType};
pub use crate::services::AppServices;
pub use crate::streaming::StreamingMultiplexer;
