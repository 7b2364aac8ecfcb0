// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 帧数据 (采集线程 → 检测/推流)

use std::io::Cursor;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;

use crate::error::Result;

/// 一帧画面, 构造后不可变
///
/// 最新帧以 `Arc<Frame>` 形式放在共享槽中, 消费者拿到的引用不会被下一帧覆盖.
#[derive(Debug)]
pub struct Frame {
    image: RgbImage,
    timestamp: DateTime<Local>,
    sequence: u64,
    processing_time: Option<Duration>,
    jpeg: OnceLock<(u8, Arc<Vec<u8>>)>, // (质量, 编码结果)
}

/// 帧元数据 (序列化给状态接口)
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FrameMetadata {
    pub timestamp: DateTime<Local>,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: &'static str,
    pub processing_time_ms: Option<f64>,
}

impl Frame {
    pub fn new(
        image: RgbImage,
        timestamp: DateTime<Local>,
        sequence: u64,
        processing_time: Option<Duration>,
    ) -> Self {
        Self {
            image,
            timestamp,
            sequence,
            processing_time,
            jpeg: OnceLock::new(),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// 防御性拷贝 (检测器只操作副本)
    pub fn copy_image(&self) -> RgbImage {
        self.image.clone()
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn processing_time(&self) -> Option<Duration> {
        self.processing_time
    }

    /// JPEG 编码
    ///
    /// 同一帧可能被多个观看者读取, 首次请求的质量会被缓存, 之后同质量直接复用.
    pub fn to_jpeg(&self, quality: u8) -> Result<Arc<Vec<u8>>> {
        if let Some((cached_quality, bytes)) = self.jpeg.get() {
            if *cached_quality == quality {
                return Ok(Arc::clone(bytes));
            }
        }

        let bytes = Arc::new(encode_jpeg(&self.image, quality)?);
        // 并发编码时保留先写入的一份
        let _ = self.jpeg.set((quality, Arc::clone(&bytes)));
        Ok(bytes)
    }

    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            timestamp: self.timestamp,
            sequence: self.sequence,
            width: self.width(),
            height: self.height(),
            format: "RGB888",
            processing_time_ms: self.processing_time.map(|d| d.as_micros() as f64 / 1000.0),
        }
    }
}

/// RGB → JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::with_capacity(image.as_raw().len() / 8));
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(image)?;
    Ok(buf.into_inner())
}
