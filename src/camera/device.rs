// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 摄像头设备抽象

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CameraConfig;
use crate::error::{Error, Result};

/// 物理摄像头句柄, 丢弃即释放硬件
pub trait CameraDevice: Send {
    /// 开始采集
    fn start(&mut self) -> Result<()>;

    /// 采集一帧原始画面 (未旋转)
    fn capture(&mut self) -> Result<RgbImage>;

    /// 停止采集 (保留句柄, 可再次 start)
    fn stop(&mut self) -> Result<()>;

    fn name(&self) -> &str;
}

/// 摄像头工厂, `CameraService::initialize` 调用
pub type DeviceFactory = Box<dyn Fn(&CameraConfig) -> Result<Box<dyn CameraDevice>> + Send + Sync>;

/// 输入源类型
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraSource {
    /// 合成测试画面
    TestPattern,
    /// 本地摄像头 (V4L2 / DirectShow / AVFoundation)
    Device { index: usize },
}

impl Default for CameraSource {
    fn default() -> Self {
        CameraSource::Device { index: 0 }
    }
}

/// 根据配置打开摄像头
pub fn open_device(config: &CameraConfig) -> Result<Box<dyn CameraDevice>> {
    let (width, height) = config.resolution;
    match &config.source {
        CameraSource::TestPattern => {
            info!("🧪 使用测试画面 {}x{}", width, height);
            Ok(Box::new(TestPatternCamera::new(width, height)))
        }
        #[cfg(feature = "ffmpeg")]
        CameraSource::Device { index } => Ok(Box::new(super::ffmpeg::FfmpegCamera::open(
            *index, config,
        )?)),
        #[cfg(not(feature = "ffmpeg"))]
        CameraSource::Device { index } => Err(Error::Hardware(format!(
            "摄像头 #{} 不可用: 未启用 ffmpeg 特性",
            index
        ))),
    }
}

/// 列出可用的摄像头设备
pub fn list_devices() -> Vec<(usize, String)> {
    #[cfg(feature = "ffmpeg")]
    {
        super::ffmpeg::get_camera_devices()
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Vec::new()
    }
}

/// 合成测试画面: 斜向渐变 + 随帧移动的亮条
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    tick: u32,
    started: bool,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
            started: false,
        }
    }
}

impl CameraDevice for TestPatternCamera {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbImage> {
        if !self.started {
            return Err(Error::Capture("测试画面未启动".into()));
        }
        let bar = self.tick % self.width.max(1);
        self.tick = self.tick.wrapping_add(4);

        let (w, h) = (self.width.max(1), self.height.max(1));
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            if x.abs_diff(bar) < 8 {
                Rgb([255, 255, 255])
            } else {
                Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 96])
            }
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}
