// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 服务配置 - 通过JSON文件调整参数

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::camera::CameraSource;
use crate::error::{Error, Result};
use crate::events::LeaveConfidence;

/// 摄像头参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub source: CameraSource,
    pub resolution: (u32, u32), // (宽, 高)
    pub frame_rate: u32,        // 采集帧率
    pub warmup_ms: u64,         // 硬件启动后的预热时间
    pub stop_timeout_ms: u64,   // 停止时等待采集线程的上限
    pub rotate_180: bool,       // 安装方向校正
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::Device { index: 0 },
            resolution: (1280, 720),
            frame_rate: 15,
            warmup_ms: 1000,
            stop_timeout_ms: 5000,
            rotate_180: true,
        }
    }
}

impl CameraConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err(Error::Config(format!(
                "非法分辨率 {}x{}",
                self.resolution.0, self.resolution.1
            )));
        }
        if !(1..=60).contains(&self.frame_rate) {
            return Err(Error::Config(format!(
                "帧率必须在 1-60 之间: {}",
                self.frame_rate
            )));
        }
        Ok(())
    }
}

/// 检测参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub model_path: String,
    pub input_size: u32,            // 模型输入尺寸
    pub interval_ms: u64,           // 检测间隔
    pub confidence: f32,            // 置信度阈值
    pub iou: f32,                   // NMS IOU阈值
    pub target_classes: Vec<String>, // 关注的类别, 为空表示全部
    pub stop_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: "models/yolo11n.onnx".to_string(),
            input_size: 640,
            interval_ms: 2000,
            confidence: 0.5,
            iou: 0.45,
            target_classes: vec!["person".into(), "cat".into(), "dog".into()],
            stop_timeout_ms: 5000,
        }
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::Config("检测间隔必须大于0".into()));
        }
        for (name, value) in [("confidence", self.confidence), ("iou", self.iou)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} 必须在 [0,1] 之间: {}", name, value)));
            }
        }
        Ok(())
    }
}

/// 进出区域事件参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub timeout_secs: f64, // 超过该时间未见则判定离开
    pub leave_confidence: LeaveConfidence,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3.0,
            leave_confidence: LeaveConfidence::default(),
        }
    }
}

/// 离开判定时间上限 (1天)
const MAX_TRACKER_TIMEOUT_SECS: f64 = 86_400.0;

impl TrackerConfig {
    /// 离开判定时间, 非法值退回默认 3 秒
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::from_secs(3))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.timeout_secs.is_finite()
            || self.timeout_secs <= 0.0
            || self.timeout_secs > MAX_TRACKER_TIMEOUT_SECS
        {
            return Err(Error::Config(format!(
                "离开判定时间必须在 (0, {}] 秒之间: {}",
                MAX_TRACKER_TIMEOUT_SECS, self.timeout_secs
            )));
        }
        if let LeaveConfidence::Fixed(c) = self.leave_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::Config(format!("离开置信度必须在 [0,1] 之间: {}", c)));
            }
        }
        Ok(())
    }
}

/// MJPEG推流参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub frame_rate: u32,            // 每个观看者的最大推流帧率
    pub quality: u8,                // JPEG质量
    pub no_frame_backoff_ms: u64,   // 尚无画面时的等待
    pub max_viewers: Option<usize>, // None = 不限制
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_rate: 15,
            quality: 85,
            no_frame_backoff_ms: 100,
            max_viewers: None,
        }
    }
}

impl StreamConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn no_frame_backoff(&self) -> Duration {
        Duration::from_millis(self.no_frame_backoff_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventLogConfig {
    pub path: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: "data/events.jsonl".to_string(),
        }
    }
}

/// 完整服务配置
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub tracker: TrackerConfig,
    pub streaming: StreamConfig,
    pub server: ServerConfig,
    pub event_log: EventLogConfig,
}

impl AppConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.detection.validate()?;
        self.tracker.validate()?;
        if !(1..=100).contains(&self.streaming.quality) {
            return Err(Error::Config(format!(
                "推流JPEG质量必须在 1-100 之间: {}",
                self.streaming.quality
            )));
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️ 当前配置:");
        info!("  摄像头: {:?}", self.camera.source);
        info!(
            "  分辨率: {}x{} @ {}fps",
            self.camera.resolution.0, self.camera.resolution.1, self.camera.frame_rate
        );
        info!(
            "  检测: {} | 间隔 {}ms | 置信度 {:.2} | 类别 {:?}",
            if self.detection.enabled { "启用" } else { "禁用" },
            self.detection.interval_ms,
            self.detection.confidence,
            self.detection.target_classes
        );
        info!(
            "  离开判定: {:.1}s | 离开置信度 {:?}",
            self.tracker.timeout_secs, self.tracker.leave_confidence
        );
        info!(
            "  推流: {}fps | 质量 {} | 观看者上限 {:?}",
            self.streaming.frame_rate, self.streaming.quality, self.streaming.max_viewers
        );
        info!("  事件日志: {}", self.event_log.path);
    }
}
