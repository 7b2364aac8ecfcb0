// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测器接口 + 通用后处理 (NMS / 标注)

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::warn;

use super::types::{Detection, DetectionParams, Prediction};
use crate::error::Result;

/// 目标检测器: 图像 → (标注图, 检测结果)
pub trait Detector: Send {
    fn name(&self) -> &str;

    fn detect(&mut self, image: &RgbImage, params: &DetectionParams) -> Result<Prediction>;
}

/// 空检测器 (未编译模型后端时使用), 永远返回空结果
#[derive(Default)]
pub struct NullDetector {
    warned: bool,
}

impl NullDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn detect(&mut self, image: &RgbImage, _params: &DetectionParams) -> Result<Prediction> {
        if !self.warned {
            warn!("⚠️ 未加载检测模型, 检测结果始终为空");
            self.warned = true;
        }
        Ok(Prediction {
            annotated: image.clone(),
            detections: Vec::new(),
        })
    }
}

/// 非极大值抑制 (同类别之间)
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id == xs[index].class_id
                && xs[prev_index].bbox.iou(&xs[index].bbox) > iou_threshold
            {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 标注框颜色: 人-红, 猫-蓝, 其他-绿
pub fn class_color(class_name: &str) -> Rgb<u8> {
    match class_name {
        "person" => Rgb([255, 0, 0]),
        "cat" => Rgb([0, 0, 255]),
        _ => Rgb([0, 255, 0]),
    }
}

/// 在图像副本上画出检测框
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    let (w, h) = (canvas.width() as f32, canvas.height() as f32);

    for det in detections {
        let bbox = det.bbox.clamp(w, h);
        let color = class_color(&det.class_name);
        // 2像素线宽
        for inset in 0..2u32 {
            let bw = bbox.width() as u32;
            let bh = bbox.height() as u32;
            if bw <= inset * 2 || bh <= inset * 2 {
                break;
            }
            let rect = Rect::at(bbox.x1 as i32 + inset as i32, bbox.y1 as i32 + inset as i32)
                .of_size(bw - inset * 2, bh - inset * 2);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}
