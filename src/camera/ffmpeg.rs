// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 本地摄像头采集 (FFmpeg)
//!
//! 支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux),
//! 解码线程通过帧过滤器把 YUV420P 转成 RGB, `capture()` 取最新一帧.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::device::CameraDevice;
use crate::config::CameraConfig;
use crate::error::{Error, Result};

const MAX_RETRIES: usize = 3;
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// FFmpeg 摄像头
pub struct FfmpegCamera {
    index: usize,
    name: String,
    url: String,
    width: u32,
    height: u32,
    frame_rate: u32,
    frames: Option<Receiver<RgbImage>>,
    stop: Arc<AtomicBool>,
    decoder: Option<JoinHandle<()>>,
}

impl FfmpegCamera {
    /// 打开设备 (只解析设备, 采集在 start 时开始)
    pub fn open(index: usize, config: &CameraConfig) -> Result<Self> {
        let devices = get_camera_devices();
        let name = devices
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.clone())
            .ok_or_else(|| {
                Error::Hardware(format!("未找到摄像头 #{} (共 {} 个设备)", index, devices.len()))
            })?;

        let url = format_camera_url(index, &name);
        info!("📷 设备索引: {} | 名称: {} | URL: {}", index, name, url);

        Ok(Self {
            index,
            name,
            url,
            width: config.resolution.0,
            height: config.resolution.1,
            frame_rate: config.frame_rate,
            frames: None,
            stop: Arc::new(AtomicBool::new(false)),
            decoder: None,
        })
    }

    fn join_decoder(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.frames = None;
        if let Some(handle) = self.decoder.take() {
            if handle.join().is_err() {
                warn!("⚠️ 摄像头解码线程以 panic 结束");
            }
        }
    }
}

impl CameraDevice for FfmpegCamera {
    fn start(&mut self) -> Result<()> {
        if self.decoder.is_some() {
            return Ok(());
        }

        self.stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = bounded::<RgbImage>(2);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

        let url = self.url.clone();
        let size = (self.width, self.height);
        let frame_rate = self.frame_rate;
        let stop = Arc::clone(&self.stop);

        let handle = thread::Builder::new()
            .name(format!("camera-ffmpeg-{}", self.index))
            .spawn(move || decode_camera(&url, size, frame_rate, frame_tx, stop, ready_tx))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                self.frames = Some(frame_rx);
                self.decoder = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(Error::Hardware(e))
            }
            Err(_) => {
                self.decoder = Some(handle);
                self.join_decoder();
                Err(Error::Hardware(format!("摄像头 {} 打开超时", self.name)))
            }
        }
    }

    fn capture(&mut self) -> Result<RgbImage> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| Error::Capture("摄像头未启动".into()))?;

        let first = match frames.recv_timeout(CAPTURE_TIMEOUT) {
            Ok(img) => img,
            Err(RecvTimeoutError::Timeout) => {
                return Err(Error::Capture(format!("{:?} 内没有新画面", CAPTURE_TIMEOUT)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Capture("摄像头解码线程已退出".into()))
            }
        };
        // 丢弃积压, 只保留最新一帧
        Ok(frames.try_iter().last().unwrap_or(first))
    }

    fn stop(&mut self) -> Result<()> {
        self.join_decoder();
        info!("📹 摄像头 {} 已停止", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.join_decoder();
    }
}

/// 格式化摄像头URL - 根据平台选择
///
/// Linux 下枚举结果是设备节点路径时直接使用; 只有名称时才按序号拼 `/dev/videoN`,
/// 此时假定枚举顺序与节点编号一致 (一个 UVC 摄像头可能占用多个节点, 不一定成立).
fn format_camera_url(index: usize, name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        let _ = index;
        format!("video={}", name)
    }
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("/dev/") {
            name.to_string()
        } else {
            format!("/dev/video{}", index)
        }
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        let _ = name;
        format!("{}", index)
    }
}

fn input_format() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dshow"
    }
    #[cfg(target_os = "macos")]
    {
        "avfoundation"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "v4l2"
    }
}

/// 解码线程: 构建上下文(最多重试3次) → 通知就绪 → 等待结束或停止
fn decode_camera(
    url: &str,
    (width, height): (u32, u32),
    frame_rate: u32,
    frame_tx: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
    ready_tx: Sender<std::result::Result<(), String>>,
) {
    let format = input_format();
    let video_size = format!("{}x{}", width, height);
    let framerate = frame_rate.to_string();
    let scale = format!("scale={}:{},format=yuv420p", width, height);
    debug!("🔍 使用格式: {}, 输入: {}", format, url);

    let mut retry_count = 0;
    let sch = loop {
        let filter = RgbFilter::new(frame_tx.clone(), Arc::clone(&stop));
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let input = Input::new(url).set_format(format).set_input_opts(
            [
                ("framerate", framerate.as_str()),
                ("video_size", video_size.as_str()),
            ]
            .into(),
        );

        let built = FfmpegContext::builder()
            .input(input)
            .filter_desc(scale.as_str())
            .output(out)
            .build()
            .map_err(|e| format!("构建失败: {}", e))
            .and_then(|ctx| ctx.start().map_err(|e| format!("启动失败: {}", e)));

        match built {
            Ok(sch) => break sch,
            Err(e) => {
                retry_count += 1;
                if retry_count >= MAX_RETRIES || stop.load(Ordering::Acquire) {
                    error!("❌ 摄像头打开失败 (重试{}次): {}", retry_count, e);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
                warn!(
                    "⚠️ 摄像头忙或无法打开, 1秒后重试... ({}/{})",
                    retry_count, MAX_RETRIES
                );
                thread::sleep(Duration::from_secs(1));
            }
        }
    };

    info!("✅ 摄像头连接成功,开始解码!");
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Acquire) && !sch.is_ended() {
        thread::sleep(Duration::from_millis(50));
    }
    if !sch.is_ended() {
        sch.abort();
    }
    debug!("📹 摄像头解码循环结束");
}

/// 帧过滤器: YUV420P → RGB, 推送到采集通道
#[derive(Clone)]
struct RgbFilter {
    frames: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
    total_frames: usize,
    dropped_frames: usize,
    count: usize,
    last: Instant,
}

impl RgbFilter {
    fn new(frames: Sender<RgbImage>, stop: Arc<AtomicBool>) -> Self {
        Self {
            frames,
            stop,
            total_frames: 0,
            dropped_frames: 0,
            count: 0,
            last: Instant::now(),
        }
    }

    fn drop_frame(&mut self, reason: &str) -> std::result::Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            debug!("⚠️ 丢弃帧 #{}: {}", self.total_frames, reason);
        }
        Ok(None)
    }
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> std::result::Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> std::result::Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Acquire) {
            return Err("camera stopped".to_string());
        }
        self.total_frames += 1;

        // SAFETY: 指针来自 FFmpeg 回调中的有效帧, 只读访问, 范围由 width/height/linesize 约束
        let image = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.drop_frame("空帧/损坏帧");
            }
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as usize, raw.height as usize);
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                return self.drop_frame("非法分辨率");
            }

            let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                return self.drop_frame("YUV指针为空");
            }
            if y_stride < w || uv_stride < w / 2 {
                return self.drop_frame("步长异常");
            }

            let mut buffer = vec![0u8; w * h * 3];
            yuv420p_to_rgb(y_plane, u_plane, v_plane, y_stride, uv_stride, &mut buffer, w, h);
            RgbImage::from_raw(w as u32, h as u32, buffer)
        };

        let Some(image) = image else {
            return self.drop_frame("RGB缓冲区尺寸不符");
        };

        self.count += 1;
        if self.last.elapsed() >= Duration::from_secs(5) {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            debug!(
                "📺 解码统计: {:.1}fps | 总帧{} | 丢弃{}",
                fps, self.total_frames, self.dropped_frames
            );
            self.last = Instant::now();
            self.count = 0;
        }

        // 通道满说明采集端落后, 丢弃本帧
        let _ = self.frames.try_send(image);
        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!("✅ 解码线程退出");
    }
}

/// YUV420P → RGB (BT.601, 定点系数 ×128)
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }
}

/// 获取可用的摄像头设备列表
pub fn get_camera_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}
