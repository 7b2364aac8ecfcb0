// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 摄像头服务
//!
//! 独占摄像头硬件, 采集线程按固定帧率刷新唯一的"最新帧"槽位.
//! 槽位和帧计数器由同一把锁保护, 多个消费者并发读取不会看到半帧.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use image::imageops;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::device::{open_device, CameraDevice, DeviceFactory};
use super::frame::{Frame, FrameMetadata};
use super::FrameSource;
use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::worker::{lock, CancelToken, Worker};

type SharedDevice = Arc<Mutex<Option<Box<dyn CameraDevice>>>>;

/// 最新帧槽位
#[derive(Default)]
struct FrameSlot {
    latest: Option<Arc<Frame>>,
    counter: u64, // 下一帧的序号 = 已采集帧数
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
}

/// 摄像头状态快照
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CameraServiceStatus {
    pub initialized: bool,
    pub running: bool,
    pub active: bool,
    pub device: Option<String>,
    pub resolution: (u32, u32),
    pub frame_rate: u32,
    pub last_frame: Option<FrameMetadata>,
    pub frame_count: u64,
    pub capture_errors: u64,
}

pub struct CameraService {
    config: CameraConfig,
    factory: DeviceFactory,
    device: SharedDevice,
    device_name: Mutex<Option<String>>, // 状态查询不碰设备锁 (采集时一直被占用)
    slot: Arc<Mutex<FrameSlot>>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    capture_alive: Arc<AtomicBool>,
    capture_errors: Arc<AtomicU64>,
}

impl CameraService {
    /// 按配置中的输入源创建
    pub fn new(config: CameraConfig) -> Self {
        Self::with_factory(config, Box::new(open_device))
    }

    /// 注入自定义设备工厂
    pub fn with_factory(config: CameraConfig, factory: DeviceFactory) -> Self {
        Self {
            config,
            factory,
            device: Arc::new(Mutex::new(None)),
            device_name: Mutex::new(None),
            slot: Arc::new(Mutex::new(FrameSlot::default())),
            lifecycle: Mutex::new(Lifecycle::default()),
            running: AtomicBool::new(false),
            capture_alive: Arc::new(AtomicBool::new(false)),
            capture_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// 打开摄像头硬件 (已初始化时直接返回成功)
    pub fn initialize(&self) -> Result<()> {
        let mut device = lock(&self.device);
        if device.is_some() {
            return Ok(());
        }

        let opened = (self.factory)(&self.config).map_err(|e| match e {
            Error::Hardware(_) => e,
            other => Error::Hardware(other.to_string()),
        })?;
        info!(
            "📷 摄像头已初始化: {} ({}x{} @ {}fps)",
            opened.name(),
            self.config.resolution.0,
            self.config.resolution.1,
            self.config.frame_rate
        );
        *lock(&self.device_name) = Some(opened.name().to_string());
        *device = Some(opened);
        Ok(())
    }

    /// 启动采集: 初始化 → 硬件启动 → 预热 → 采集线程
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        // 上次 stop 超时留下的线程, 先回收
        if let Some(mut stale) = lifecycle.worker.take() {
            if let Err(e) = stale.shutdown(self.config.stop_timeout()) {
                lifecycle.worker = Some(stale);
                return Err(e);
            }
        }

        self.initialize()?;
        {
            let mut device = lock(&self.device);
            let device = device.as_mut().ok_or(Error::NotInitialized)?;
            device.start().map_err(|e| match e {
                Error::Hardware(_) => e,
                other => Error::Hardware(other.to_string()),
            })?;
        }

        let warmup = self.config.warmup();
        if !warmup.is_zero() {
            debug!("⏳ 摄像头预热 {:?}", warmup);
            thread::sleep(warmup);
        }

        let capture = CaptureLoop {
            device: Arc::clone(&self.device),
            slot: Arc::clone(&self.slot),
            alive: Arc::clone(&self.capture_alive),
            errors: Arc::clone(&self.capture_errors),
            interval: self.config.frame_interval(),
            rotate: self.config.rotate_180,
        };

        self.capture_alive.store(true, Ordering::Release);
        match Worker::spawn("camera-capture", move |token| capture.run(token)) {
            Ok(worker) => {
                lifecycle.worker = Some(worker);
                self.running.store(true, Ordering::Release);
                info!("🎥 摄像头采集已启动 ({}fps)", self.config.frame_rate);
                Ok(())
            }
            Err(e) => {
                self.capture_alive.store(false, Ordering::Release);
                if let Some(device) = lock(&self.device).as_mut() {
                    let _ = device.stop();
                }
                Err(e)
            }
        }
    }

    /// 停止采集线程(有界等待)后停止硬件. 未运行时安全调用.
    ///
    /// 超时返回 `Error::ShutdownTimeout`, 线程句柄保留, 可再次调用重试.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        self.running.store(false, Ordering::Release);

        let Some(worker) = lifecycle.worker.as_mut() else {
            return Ok(());
        };
        worker.shutdown(self.config.stop_timeout())?;
        lifecycle.worker = None;

        if let Some(device) = lock(&self.device).as_mut() {
            if let Err(e) = device.stop() {
                warn!("⚠️ 摄像头硬件停止失败: {}", e);
            }
        }
        info!("🛑 摄像头采集已停止");
        Ok(())
    }

    /// 停止 + 释放硬件 + 计数清零. 可重复调用.
    pub fn cleanup(&self) -> Result<()> {
        self.stop()?;

        {
            let mut device = lock(&self.device);
            if let Some(device) = device.take() {
                info!("🧹 释放摄像头: {}", device.name());
            }
            *lock(&self.device_name) = None;
        }
        *lock(&self.slot) = FrameSlot::default();
        self.capture_errors.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// 当前最新帧 (从不等待新帧)
    pub fn get_latest_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.slot).latest.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 运行中且采集线程存活
    pub fn is_active(&self) -> bool {
        self.is_running() && self.capture_alive.load(Ordering::Acquire)
    }

    pub fn get_status(&self) -> CameraServiceStatus {
        let device = lock(&self.device_name).clone();
        let (last_frame, frame_count) = {
            let slot = lock(&self.slot);
            (slot.latest.as_ref().map(|f| f.metadata()), slot.counter)
        };

        CameraServiceStatus {
            initialized: device.is_some(),
            running: self.is_running(),
            active: self.is_active(),
            device,
            resolution: self.config.resolution,
            frame_rate: self.config.frame_rate,
            last_frame,
            frame_count,
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
        }
    }
}

impl FrameSource for CameraService {
    fn is_active(&self) -> bool {
        CameraService::is_active(self)
    }

    fn ensure_running(&self) -> Result<()> {
        self.start()
    }

    fn latest_frame(&self) -> Result<Option<Arc<Frame>>> {
        Ok(self.get_latest_frame())
    }

    fn status(&self) -> CameraServiceStatus {
        self.get_status()
    }
}

impl Drop for CameraService {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            error!("❌ 摄像头服务释放失败: {}", e);
        }
    }
}

/// 采集线程状态
struct CaptureLoop {
    device: SharedDevice,
    slot: Arc<Mutex<FrameSlot>>,
    alive: Arc<AtomicBool>,
    errors: Arc<AtomicU64>,
    interval: Duration,
    rotate: bool,
}

/// 线程退出时清除存活标记
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CaptureLoop {
    fn run(self, token: CancelToken) {
        let _alive = AliveGuard(Arc::clone(&self.alive));
        debug!("📹 采集线程启动, 间隔 {:?}", self.interval);

        while !token.is_cancelled() {
            let tick = Instant::now();

            let captured = match lock(&self.device).as_mut() {
                Some(device) => device.capture(),
                None => Err(Error::NotInitialized),
            };

            match captured {
                Ok(mut image) => {
                    if self.rotate {
                        imageops::rotate180_in_place(&mut image);
                    }
                    let processing_time = tick.elapsed();

                    let mut slot = lock(&self.slot);
                    let frame = Frame::new(image, Local::now(), slot.counter, Some(processing_time));
                    slot.counter += 1;
                    slot.latest = Some(Arc::new(frame));
                }
                Err(Error::NotInitialized) => {
                    error!("❌ 摄像头句柄已释放, 采集线程退出");
                    break;
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    if e.is_transient() {
                        warn!("⚠️ 采集失败: {}", e);
                    } else {
                        error!("❌ 摄像头异常: {}", e);
                    }
                    if !token.sleep(self.interval) {
                        break;
                    }
                    continue;
                }
            }

            let elapsed = tick.elapsed();
            if elapsed >= self.interval {
                debug!("🐢 采集耗时 {:?} 超过帧间隔 {:?}", elapsed, self.interval);
                continue;
            }
            if !token.sleep(self.interval - elapsed) {
                break;
            }
        }
        debug!("📹 采集线程退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;

    /// 测试摄像头: 每帧所有像素都等于帧号 (标记), 可注入采集失败
    struct ScriptedCamera {
        starts: Arc<AtomicUsize>,
        captures: Arc<AtomicUsize>,
        fail_every: Option<usize>,
        marker_corner: bool,
    }

    impl CameraDevice for ScriptedCamera {
        fn start(&mut self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn capture(&mut self) -> Result<RgbImage> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if let Some(every) = self.fail_every {
                if n % every == 0 {
                    return Err(Error::Capture(format!("scripted failure #{}", n)));
                }
            }
            if self.marker_corner {
                let mut img = RgbImage::new(8, 4);
                img.put_pixel(0, 0, Rgb([255, 0, 0]));
                return Ok(img);
            }
            let v = (n % 256) as u8;
            Ok(RgbImage::from_pixel(8, 4, Rgb([v, v, v])))
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn test_config(frame_rate: u32) -> CameraConfig {
        CameraConfig {
            resolution: (8, 4),
            frame_rate,
            warmup_ms: 0,
            stop_timeout_ms: 2000,
            ..CameraConfig::default()
        }
    }

    fn scripted_service(
        frame_rate: u32,
        fail_every: Option<usize>,
    ) -> (CameraService, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let captures = Arc::new(AtomicUsize::new(0));
        let (s, c) = (Arc::clone(&starts), Arc::clone(&captures));
        let service = CameraService::with_factory(
            test_config(frame_rate),
            Box::new(move |_: &CameraConfig| {
                Ok(Box::new(ScriptedCamera {
                    starts: Arc::clone(&s),
                    captures: Arc::clone(&c),
                    fail_every,
                    marker_corner: false,
                }) as Box<dyn CameraDevice>)
            }),
        );
        (service, starts, captures)
    }

    fn wait_for_frame(service: &CameraService) -> Arc<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(frame) = service.get_latest_frame() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame captured");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let opens = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&opens);
        let service = CameraService::with_factory(
            test_config(30),
            Box::new(move |_: &CameraConfig| {
                o.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedCamera {
                    starts: Arc::new(AtomicUsize::new(0)),
                    captures: Arc::new(AtomicUsize::new(0)),
                    fail_every: None,
                    marker_corner: false,
                }) as Box<dyn CameraDevice>)
            }),
        );
        service.initialize().unwrap();
        service.initialize().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(service.get_status().initialized);
        assert!(!service.is_running());
    }

    #[test]
    fn hardware_failure_is_reported() {
        let service = CameraService::with_factory(
            test_config(30),
            Box::new(|_: &CameraConfig| -> Result<Box<dyn CameraDevice>> {
                Err(Error::Hardware("no /dev/video0".into()))
            }),
        );
        assert!(matches!(service.initialize(), Err(Error::Hardware(_))));
        assert!(matches!(service.start(), Err(Error::Hardware(_))));
        assert!(!service.is_active());
    }

    #[test]
    fn start_twice_runs_one_capture_thread() {
        let (service, starts, captures) = scripted_service(50, None);
        service.start().unwrap();
        service.start().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(400));
        service.stop().unwrap();

        // 50fps × 0.4s = 20 帧, 两个线程会接近 40
        let count = captures.load(Ordering::SeqCst);
        assert!(count > 0);
        assert!(count <= 28, "capture count {} suggests a second thread", count);
        assert_eq!(service.get_status().frame_count as usize, count);
    }

    #[test]
    fn sequence_is_monotonic_and_frames_are_whole() {
        let (service, _, _) = scripted_service(60, None);
        let service = Arc::new(service);
        service.start().unwrap();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    let mut last_seq = None;
                    let deadline = Instant::now() + Duration::from_millis(300);
                    while Instant::now() < deadline {
                        if let Some(frame) = service.get_latest_frame() {
                            if let Some(prev) = last_seq {
                                assert!(frame.sequence() >= prev);
                            }
                            last_seq = Some(frame.sequence());
                            let marker = frame.image().as_raw()[0];
                            assert!(frame.image().as_raw().iter().all(|&b| b == marker));
                            assert_eq!(marker as u64, frame.sequence() % 256);
                        }
                    }
                    last_seq
                })
            })
            .collect();

        for reader in readers {
            assert!(reader.join().unwrap().is_some());
        }
        service.stop().unwrap();
    }

    #[test]
    fn capture_errors_do_not_stop_the_loop() {
        let (service, _, captures) = scripted_service(60, Some(2));
        service.start().unwrap();
        thread::sleep(Duration::from_millis(250));

        assert!(service.is_active());
        let status = service.get_status();
        assert!(status.capture_errors >= 2);
        assert!(status.frame_count >= 2);
        assert!(captures.load(Ordering::SeqCst) >= 4);
        service.stop().unwrap();
    }

    #[test]
    fn frames_are_rotated_180() {
        let service = CameraService::with_factory(
            test_config(30),
            Box::new(|_: &CameraConfig| {
                Ok(Box::new(ScriptedCamera {
                    starts: Arc::new(AtomicUsize::new(0)),
                    captures: Arc::new(AtomicUsize::new(0)),
                    fail_every: None,
                    marker_corner: true,
                }) as Box<dyn CameraDevice>)
            }),
        );
        service.start().unwrap();
        let frame = wait_for_frame(&service);
        assert_eq!(frame.image().get_pixel(7, 3), &Rgb([255, 0, 0]));
        assert_eq!(frame.image().get_pixel(0, 0), &Rgb([0, 0, 0]));
        service.cleanup().unwrap();
    }

    /// 每次采集阻塞一段时间, 模拟等待硬件出帧
    struct SlowCamera {
        capturing: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl CameraDevice for SlowCamera {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn capture(&mut self) -> Result<RgbImage> {
            self.capturing.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(RgbImage::new(8, 4))
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn status_does_not_wait_for_a_capture_in_progress() {
        let capturing = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&capturing);
        let service = CameraService::with_factory(
            test_config(30),
            Box::new(move |_: &CameraConfig| {
                Ok(Box::new(SlowCamera {
                    capturing: Arc::clone(&c),
                    delay: Duration::from_millis(800),
                }) as Box<dyn CameraDevice>)
            }),
        );
        service.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while capturing.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "capture never started");
            thread::sleep(Duration::from_millis(5));
        }
        // 采集线程此刻持有设备锁
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let status = service.get_status();
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "get_status blocked for {:?}",
            started.elapsed()
        );
        assert!(status.initialized);
        assert_eq!(status.device.as_deref(), Some("slow"));
        assert!(status.running);

        service.cleanup().unwrap();
        assert_eq!(service.get_status().device, None);
    }

    #[test]
    fn stop_and_cleanup_are_safe_to_repeat() {
        let (service, _, _) = scripted_service(30, None);
        service.stop().unwrap();
        service.cleanup().unwrap();

        service.start().unwrap();
        wait_for_frame(&service);
        service.cleanup().unwrap();
        service.cleanup().unwrap();

        let status = service.get_status();
        assert!(!status.initialized);
        assert!(!status.running);
        assert_eq!(status.frame_count, 0);
        assert!(service.get_latest_frame().is_none());

        // 清理后可再次启动
        service.start().unwrap();
        assert!(wait_for_frame(&service).sequence() < 5);
        service.stop().unwrap();
    }
}
