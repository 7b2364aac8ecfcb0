// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 服务装配: 摄像头 → (检测循环, 推流) → 事件追踪 → 事件日志
//!
//! 所有服务显式构造并通过参数传递, 没有全局单例.

use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::camera::{CameraService, FrameSource};
use crate::config::AppConfig;
use crate::detection::{create_detector, DetectionLoop, Detector};
use crate::error::Result;
use crate::events::{EventSink, EventTracker, JsonlEventLog};
use crate::streaming::StreamingMultiplexer;

pub struct AppServices {
    pub camera: Arc<CameraService>,
    pub sink: Arc<dyn EventSink>,
    pub tracker: Arc<Mutex<EventTracker>>,
    pub detection: DetectionLoop,
    pub streaming: StreamingMultiplexer,
}

impl AppServices {
    /// 按配置创建全部服务 (不启动任何线程)
    pub fn init(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let camera = Arc::new(CameraService::new(config.camera.clone()));
        let sink: Arc<dyn EventSink> = Arc::new(JsonlEventLog::open(&config.event_log.path)?);
        let detector = create_detector(&config.detection);
        Ok(Self::from_parts(config, camera, sink, detector))
    }

    /// 使用注入的摄像头/事件日志/检测器装配
    pub fn from_parts(
        config: &AppConfig,
        camera: Arc<CameraService>,
        sink: Arc<dyn EventSink>,
        detector: Box<dyn Detector>,
    ) -> Self {
        let tracker = Arc::new(Mutex::new(
            EventTracker::new(Arc::clone(&sink), config.tracker.timeout())
                .with_leave_confidence(config.tracker.leave_confidence),
        ));

        let source: Arc<dyn FrameSource> = camera.clone();
        let detection = DetectionLoop::new(
            Arc::clone(&source),
            Arc::clone(&tracker),
            detector,
            &config.detection,
        );
        let streaming = StreamingMultiplexer::new(source, config.streaming.clone());

        Self {
            camera,
            sink,
            tracker,
            detection,
            streaming,
        }
    }

    /// 按配置启动: 摄像头 → 检测 → 推流
    pub fn start(&self, detection: bool, streaming: bool) -> Result<()> {
        self.camera.start()?;
        if detection {
            self.detection.start()?;
        }
        if streaming {
            self.streaming.start_streaming()?;
        }
        Ok(())
    }

    /// 停止检测 → 关闭推流 → 释放摄像头
    pub fn shutdown(&self) -> Result<()> {
        info!("🧹 正在关闭服务...");
        let detection = self.detection.stop();
        if let Err(e) = &detection {
            error!("❌ 检测循环停止失败: {}", e);
        }
        self.streaming.stop_streaming();
        self.camera.cleanup()?;
        detection?;
        info!("✅ 服务已关闭");
        Ok(())
    }
}
