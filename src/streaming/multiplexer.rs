// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 推流复用器
//!
//! 每个观看者一个独立的 `MjpegStream`, 都从同一个最新帧来源拉取,
//! 与检测节奏无关, 也不负责摄像头的生命周期.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::mjpeg::format_part;
use crate::camera::{CameraServiceStatus, FrameSource};
use crate::config::StreamConfig;
use crate::error::{Error, Result};

/// 推流状态快照
#[derive(Clone, Debug, Serialize)]
pub struct StreamingStatus {
    pub streaming_active: bool,
    pub active_streams: usize,
    pub max_viewers: Option<usize>,
    pub frame_rate: u32,
    pub quality: u8,
    pub frames_sent: u64,
    pub camera_running: bool,
    pub camera: CameraServiceStatus,
}

pub struct StreamingMultiplexer {
    source: Arc<dyn FrameSource>,
    config: StreamConfig,
    active: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    frames_sent: Arc<AtomicU64>,
}

impl StreamingMultiplexer {
    pub fn new(source: Arc<dyn FrameSource>, config: StreamConfig) -> Self {
        Self {
            source,
            config,
            active: Arc::new(AtomicBool::new(false)),
            viewers: Arc::new(AtomicUsize::new(0)),
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 开启推流 (确保摄像头在运行)
    pub fn start_streaming(&self) -> Result<()> {
        self.source.ensure_running()?;
        if !self.active.swap(true, Ordering::AcqRel) {
            info!(
                "📡 推流已开启: {}fps | 质量 {}",
                self.config.frame_rate, self.config.quality
            );
        }
        Ok(())
    }

    /// 关闭推流, 现有观看者在下一帧结束 (摄像头保持运行)
    pub fn stop_streaming(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("📴 推流已关闭");
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 为一个观看者创建帧序列
    pub fn create_stream(&self) -> Result<MjpegStream> {
        if !self.is_streaming() {
            return Err(Error::NotActive("推流未开启".into()));
        }
        if let Some(max) = self.config.max_viewers {
            let current = self.get_stream_count();
            if current >= max {
                return Err(Error::OverCapacity(format!("{}/{}", current, max)));
            }
        }

        Ok(MjpegStream {
            source: Arc::clone(&self.source),
            active: Arc::clone(&self.active),
            viewers: Arc::clone(&self.viewers),
            frames_sent: Arc::clone(&self.frames_sent),
            quality: self.config.quality,
            interval: self.config.frame_interval(),
            backoff: self.config.no_frame_backoff(),
            guard: None,
            next_due: None,
            finished: false,
        })
    }

    /// 当前观看者数量
    pub fn get_stream_count(&self) -> usize {
        self.viewers.load(Ordering::Acquire)
    }

    pub fn get_status(&self) -> StreamingStatus {
        let camera = self.source.status();
        StreamingStatus {
            streaming_active: self.is_streaming(),
            active_streams: self.get_stream_count(),
            max_viewers: self.config.max_viewers,
            frame_rate: self.config.frame_rate,
            quality: self.config.quality,
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            camera_running: camera.running,
            camera,
        }
    }
}

/// 观看者计数: 创建时加一, 丢弃时减一
struct ViewerGuard(Arc<AtomicUsize>);

impl ViewerGuard {
    fn new(viewers: Arc<AtomicUsize>) -> Self {
        let count = viewers.fetch_add(1, Ordering::AcqRel) + 1;
        info!("👀 观看者接入, 当前 {} 人", count);
        Self(viewers)
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::AcqRel) - 1;
        info!("👋 观看者断开, 当前 {} 人", count);
    }
}

/// 单个观看者的 MJPEG 分段序列
///
/// 阻塞式迭代器: 每次 `next()` 按帧率节流后返回一个 multipart 分段.
/// 推流关闭、摄像头停止、取帧或编码失败时结束. 计数在首次迭代时加一,
/// 结束或被丢弃时减一 (只减一次).
pub struct MjpegStream {
    source: Arc<dyn FrameSource>,
    active: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    frames_sent: Arc<AtomicU64>,
    quality: u8,
    interval: Duration,
    backoff: Duration,
    guard: Option<ViewerGuard>,
    next_due: Option<Instant>,
    finished: bool,
}

impl MjpegStream {
    fn finish(&mut self) -> Option<Vec<u8>> {
        self.finished = true;
        self.guard = None;
        None
    }

    fn live(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.source.is_active()
    }
}

impl Iterator for MjpegStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }
        if self.guard.is_none() {
            self.guard = Some(ViewerGuard::new(Arc::clone(&self.viewers)));
        }

        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        loop {
            if !self.live() {
                return self.finish();
            }

            let frame = match self.source.latest_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    thread::sleep(self.backoff);
                    continue;
                }
                Err(e) => {
                    warn!("⚠️ 推流取帧失败, 结束该观看者: {}", e);
                    return self.finish();
                }
            };

            match frame.to_jpeg(self.quality) {
                Ok(jpeg) => {
                    self.next_due = Some(Instant::now() + self.interval);
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                    return Some(format_part(&jpeg));
                }
                Err(e) => {
                    warn!("⚠️ JPEG编码失败, 结束该观看者: {}", e);
                    return self.finish();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubSource;

    fn mux(source: Arc<StubSource>, frame_rate: u32, max_viewers: Option<usize>) -> StreamingMultiplexer {
        StreamingMultiplexer::new(
            source,
            StreamConfig {
                frame_rate,
                quality: 70,
                no_frame_backoff_ms: 5,
                max_viewers,
            },
        )
    }

    #[test]
    fn create_stream_requires_active_streaming() {
        let source = Arc::new(StubSource::with_frame(1));
        let mux = mux(source.clone(), 30, None);
        assert!(matches!(mux.create_stream(), Err(Error::NotActive(_))));

        mux.start_streaming().unwrap();
        assert_eq!(source.ensure_calls(), 1);
        assert!(mux.create_stream().is_ok());
    }

    #[test]
    fn viewer_count_follows_stream_lifetime() {
        let source = Arc::new(StubSource::with_frame(9));
        let mux = mux(source, 60, None);
        mux.start_streaming().unwrap();

        let mut a = mux.create_stream().unwrap();
        let mut b = mux.create_stream().unwrap();
        // 计数在首次迭代时才增加
        assert_eq!(mux.get_stream_count(), 0);

        let part = a.next().unwrap();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(part.ends_with(b"\r\n"));
        b.next().unwrap();
        assert_eq!(mux.get_stream_count(), 2);

        drop(a);
        assert_eq!(mux.get_stream_count(), 1);
        drop(b);
        assert_eq!(mux.get_stream_count(), 0);
    }

    #[test]
    fn source_failure_ends_stream_and_decrements_once() {
        let source = Arc::new(StubSource::with_frame(2));
        let mux = mux(source.clone(), 60, None);
        mux.start_streaming().unwrap();

        let mut stream = mux.create_stream().unwrap();
        assert!(stream.next().is_some());
        assert_eq!(mux.get_stream_count(), 1);

        source.set_failing(true);
        assert!(stream.next().is_none());
        assert_eq!(mux.get_stream_count(), 0);
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(mux.get_stream_count(), 0);
    }

    #[test]
    fn stream_ends_when_streaming_stops_or_camera_goes_away() {
        let source = Arc::new(StubSource::with_frame(3));
        let mux = mux(source.clone(), 60, None);
        mux.start_streaming().unwrap();

        let mut stream = mux.create_stream().unwrap();
        assert!(stream.next().is_some());
        mux.stop_streaming();
        assert!(stream.next().is_none());
        assert_eq!(mux.get_stream_count(), 0);
        assert!(source.is_active());

        mux.start_streaming().unwrap();
        let mut stream = mux.create_stream().unwrap();
        assert!(stream.next().is_some());
        source.set_active(false);
        assert!(stream.next().is_none());
    }

    #[test]
    fn waits_for_first_frame() {
        let source = Arc::new(StubSource::new());
        let mux = mux(source.clone(), 60, None);
        mux.start_streaming().unwrap();
        let mut stream = mux.create_stream().unwrap();

        let feeder = {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                source.set_frame(5);
            })
        };
        assert!(stream.next().is_some());
        assert!(source.reads() >= 2);
        feeder.join().unwrap();
    }

    #[test]
    fn emission_rate_is_capped() {
        let source = Arc::new(StubSource::with_frame(4));
        let mux = mux(source, 20, None);
        mux.start_streaming().unwrap();

        let started = Instant::now();
        let parts: Vec<_> = mux.create_stream().unwrap().take(5).collect();
        assert_eq!(parts.len(), 5);
        // 20fps: 5帧至少间隔 4 × 50ms
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(mux.get_stream_count(), 0);
        assert_eq!(mux.get_status().frames_sent, 5);
    }

    #[test]
    fn optional_viewer_cap() {
        let source = Arc::new(StubSource::with_frame(6));
        let mux = mux(source, 60, Some(1));
        mux.start_streaming().unwrap();

        let mut first = mux.create_stream().unwrap();
        first.next().unwrap();
        assert!(matches!(mux.create_stream(), Err(Error::OverCapacity(_))));
        drop(first);
        assert!(mux.create_stream().is_ok());
    }
}
