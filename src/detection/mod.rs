// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测模块: 检测器 + 定时检测循环

mod detector;
mod service;
pub mod types;
#[cfg(feature = "yolo")]
mod yolo;

pub use detector::{annotate, class_color, non_max_suppression, Detector, NullDetector};
pub use service::{DetectionLoop, DetectionStats, DetectionStatus};
pub use types::{BBox, Detection, DetectionParams, Prediction, COCO_CLASSES};
#[cfg(feature = "yolo")]
pub use yolo::YoloDetector;

use tracing::warn;

use crate::config::DetectionConfig;

/// 按配置创建检测器; 模型不可用时退回空检测器
pub fn create_detector(config: &DetectionConfig) -> Box<dyn Detector> {
    #[cfg(feature = "yolo")]
    {
        match YoloDetector::new(config) {
            Ok(detector) => return Box::new(detector),
            Err(e) => warn!("⚠️ 模型加载失败: {}, 使用空检测器", e),
        }
    }
    #[cfg(not(feature = "yolo"))]
    warn!(
        "⚠️ 未启用 yolo 特性, 忽略模型 {}, 使用空检测器",
        config.model_path
    );

    Box::new(NullDetector::new())
}
