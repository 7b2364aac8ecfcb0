// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! YOLOv8 / YOLO11 ONNX 检测器 (ONNX Runtime)
//!
//! 预处理: 等比缩放到 `input_size`, 左上角对齐, 其余填灰 → NCHW f32
//! 后处理: `[1, 4 + nc, anchors]` 解码 → 置信度过滤 → 同类 NMS → 目标类别过滤

use std::path::Path;
use std::time::Instant;

use fast_image_resize as fr;
use image::RgbImage;
use ndarray::{s, Array, Axis, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::{debug, info};

use super::detector::{annotate, non_max_suppression, Detector};
use super::types::{class_name, BBox, Detection, DetectionParams, Prediction};
use crate::config::DetectionConfig;
use crate::error::{Error, Result};

const CXYWH_OFFSET: usize = 4;
const PAD_VALUE: f32 = 114.0 / 255.0;

fn ort_err(e: ort::Error) -> Error {
    Error::Detection(e.to_string())
}

pub struct YoloDetector {
    session: Session,
    input_name: String,
    output_name: String,
    input_size: u32,
    resizer: fr::Resizer,
    name: String,
}

impl YoloDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let path = Path::new(&config.model_path);
        if !path.exists() {
            return Err(Error::Config(format!("模型文件不存在: {}", path.display())));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(path))
            .map_err(ort_err)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::Detection("模型没有输入".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Detection("模型没有输出".into()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "yolo".to_string());
        info!(
            "🧠 模型已加载: {} | 输入 {} {}x{} | 输出 {}",
            name, input_name, config.input_size, config.input_size, output_name
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            input_size: config.input_size,
            resizer: fr::Resizer::new(),
            name,
        })
    }

    /// 缩放比例 + 新尺寸
    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, u32, u32) {
        let size = self.input_size as f32;
        let r = (size / w0).min(size / h0);
        (r, ((w0 * r).round() as u32).max(1), ((h0 * r).round() as u32).max(1))
    }

    fn preprocess(&mut self, image: &RgbImage) -> Result<(Array<f32, IxDyn>, f32)> {
        let (w0, h0) = image.dimensions();
        let (ratio, w_new, h_new) = self.scale_wh(w0 as f32, h0 as f32);

        let src = fr::images::ImageRef::new(w0, h0, image.as_raw(), fr::PixelType::U8x3)
            .map_err(|e| Error::Detection(e.to_string()))?;
        let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .map_err(|e| Error::Detection(e.to_string()))?;

        let size = self.input_size as usize;
        let mut ys = Array::from_elem(IxDyn(&[1, 3, size, size]), PAD_VALUE);
        let row = w_new as usize * 3;
        for (y, line) in dst.buffer().chunks_exact(row).enumerate() {
            for (x, px) in line.chunks_exact(3).enumerate() {
                ys[[0, 0, y, x]] = px[0] as f32 / 255.0;
                ys[[0, 1, y, x]] = px[1] as f32 / 255.0;
                ys[[0, 2, y, x]] = px[2] as f32 / 255.0;
            }
        }
        Ok((ys, ratio))
    }

    fn postprocess(
        &self,
        preds: ndarray::ArrayViewD<'_, f32>,
        ratio: f32,
        (width, height): (f32, f32),
        params: &DetectionParams,
    ) -> Result<Vec<Detection>> {
        if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
            return Err(Error::Detection(format!("非预期的输出形状 {:?}", preds.shape())));
        }

        let mut data = Vec::new();
        let anchors = preds.slice(s![0, .., ..]);
        for pred in anchors.axis_iter(Axis(1)) {
            let clss = pred.slice(s![CXYWH_OFFSET..]);
            let Some((id, &confidence)) = clss
                .iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < params.confidence {
                continue;
            }

            let class_name = class_name(id);
            if !params.accepts(&class_name) {
                continue;
            }

            let bbox = BBox::from_cxcywh(
                pred[0] / ratio,
                pred[1] / ratio,
                pred[2] / ratio,
                pred[3] / ratio,
            )
            .clamp(width, height);

            data.push(Detection {
                class_id: id,
                class_name,
                confidence,
                bbox,
            });
        }

        non_max_suppression(&mut data, params.iou);
        Ok(data)
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, image: &RgbImage, params: &DetectionParams) -> Result<Prediction> {
        let t_pre = Instant::now();
        let (input, ratio) = self.preprocess(image)?;
        let pre_ms = t_pre.elapsed().as_secs_f64() * 1000.0;

        let t_run = Instant::now();
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input.view()].map_err(ort_err)?)
            .map_err(ort_err)?;
        let preds = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(ort_err)?;
        let run_ms = t_run.elapsed().as_secs_f64() * 1000.0;

        let t_post = Instant::now();
        let size = (image.width() as f32, image.height() as f32);
        let detections = self.postprocess(preds, ratio, size, params)?;
        let post_ms = t_post.elapsed().as_secs_f64() * 1000.0;

        debug!(
            "🔍 预处理 {:.1}ms | 推理 {:.1}ms | 后处理 {:.1}ms | {} 个目标",
            pre_ms,
            run_ms,
            post_ms,
            detections.len()
        );

        Ok(Prediction {
            annotated: annotate(image, &detections),
            detections,
        })
    }
}
