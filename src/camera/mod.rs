// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 摄像头采集 + 最新帧共享

mod device;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
mod frame;
mod service;

use std::sync::Arc;

pub use device::{list_devices, open_device, CameraDevice, CameraSource, DeviceFactory, TestPatternCamera};
pub use frame::{encode_jpeg, Frame, FrameMetadata};
pub use service::{CameraService, CameraServiceStatus};

use crate::error::Result;

/// 最新帧来源 (检测循环和推流共享同一个来源, 都不负责其生命周期)
pub trait FrameSource: Send + Sync {
    /// 采集线程是否在产出画面
    fn is_active(&self) -> bool;

    /// 未运行则启动 (已运行时直接返回成功)
    fn ensure_running(&self) -> Result<()>;

    /// 当前最新帧, 不等待新帧
    fn latest_frame(&self) -> Result<Option<Arc<Frame>>>;

    fn status(&self) -> CameraServiceStatus;
}
