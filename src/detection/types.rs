// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测数据结构定义
/// Data structures for detection
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// COCO 80类
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// 类别ID → 类别名 (超出范围时为 `class_{id}`)
pub fn class_name(class_id: usize) -> String {
    COCO_CLASSES
        .get(class_id)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("class_{}", class_id))
}

// ========== 数据结构 ==========

/// 检测框 (原图像素坐标)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 中心点 + 宽高
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let l = self.x1.max(other.x1);
        let r = self.x2.min(other.x2);
        let t = self.y1.max(other.y1);
        let b = self.y2.min(other.y2);
        (r - l).max(0.0) * (b - t).max(0.0)
    }

    pub fn union(&self, other: &BBox) -> f32 {
        self.area() + other.area() - self.intersection_area(other)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let union = self.union(other);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / union
    }

    /// 限制在图像范围内
    pub fn clamp(&self, width: f32, height: f32) -> Self {
        Self::new(
            self.x1.clamp(0.0, width),
            self.y1.clamp(0.0, height),
            self.x2.clamp(0.0, width),
            self.y2.clamp(0.0, height),
        )
    }
}

/// 单个检测目标
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// 检测参数
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionParams {
    pub confidence: f32,
    pub iou: f32,
    /// 为空表示不过滤
    pub target_classes: Vec<String>,
}

impl DetectionParams {
    pub fn accepts(&self, class_name: &str) -> bool {
        self.target_classes.is_empty() || self.target_classes.iter().any(|c| c == class_name)
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.45,
            target_classes: Vec::new(),
        }
    }
}

/// 检测器输出: 标注图 + 检测结果
#[derive(Clone, Debug)]
pub struct Prediction {
    pub annotated: RgbImage,
    pub detections: Vec<Detection>,
}
