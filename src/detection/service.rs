// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 定时检测循环 (Detection loop)
//! 职责: 按固定间隔取最新帧 → 检测 → 喂给事件追踪器
//!
//! 摄像头是共享资源, 检测循环只在启动时确保它在运行, 停止时不碰它.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::detector::Detector;
use super::types::DetectionParams;
use crate::camera::FrameSource;
use crate::config::DetectionConfig;
use crate::error::Result;
use crate::events::EventTracker;
use crate::worker::{lock, CancelToken, Worker};

/// 检测统计
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct DetectionStats {
    pub ticks: u64,
    pub skipped_inactive: u64,
    pub skipped_no_frame: u64,
    pub errors: u64,
    pub overruns: u64,
    pub events_emitted: u64,
    pub last_detections: usize,
    pub last_processing_ms: f64,
    pub last_frame_sequence: Option<u64>,
}

/// 检测状态快照
#[derive(Clone, Debug, Serialize)]
pub struct DetectionStatus {
    pub running: bool,
    pub detector: String,
    pub interval_secs: f64,
    pub confidence: f32,
    pub iou: f32,
    pub target_classes: Vec<String>,
    pub camera_running: bool,
    pub camera_service_active: bool,
    /// 在区域内的类别 → 距最后出现的秒数
    pub current_objects: BTreeMap<String, f64>,
    pub stats: DetectionStats,
}

pub struct DetectionLoop {
    source: Arc<dyn FrameSource>,
    tracker: Arc<Mutex<EventTracker>>,
    detector: Arc<Mutex<Box<dyn Detector>>>,
    detector_name: String, // 检测进行中也能读取
    params: DetectionParams,
    interval: Duration,
    stop_timeout: Duration,
    stats: Arc<Mutex<DetectionStats>>,
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
}

impl DetectionLoop {
    pub fn new(
        source: Arc<dyn FrameSource>,
        tracker: Arc<Mutex<EventTracker>>,
        detector: Box<dyn Detector>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            source,
            tracker,
            detector_name: detector.name().to_string(),
            detector: Arc::new(Mutex::new(detector)),
            params: DetectionParams {
                confidence: config.confidence,
                iou: config.iou,
                target_classes: config.target_classes.clone(),
            },
            interval: config.interval(),
            stop_timeout: config.stop_timeout(),
            stats: Arc::new(Mutex::new(DetectionStats::default())),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// 启动检测 (先确保摄像头在运行)
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(mut stale) = worker.take() {
            if let Err(e) = stale.shutdown(self.stop_timeout) {
                *worker = Some(stale);
                return Err(e);
            }
        }

        self.source.ensure_running()?;

        let ticker = DetectionTicker {
            source: Arc::clone(&self.source),
            tracker: Arc::clone(&self.tracker),
            detector: Arc::clone(&self.detector),
            params: self.params.clone(),
            stats: Arc::clone(&self.stats),
        };
        let interval = self.interval;
        *worker = Some(Worker::spawn("detection", move |token| {
            ticker.run(token, interval)
        })?);
        self.running.store(true, Ordering::Release);

        info!(
            "🔍 检测循环已启动: 间隔 {:?} | 置信度 {:.2} | 类别 {:?}",
            self.interval, self.params.confidence, self.params.target_classes
        );
        Ok(())
    }

    /// 停止检测循环 (不停止摄像头)
    pub fn stop(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.running.store(false, Ordering::Release);

        let Some(active) = worker.as_mut() else {
            return Ok(());
        };
        active.shutdown(self.stop_timeout)?;
        *worker = None;
        info!("🛑 检测循环已停止");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DetectionStats {
        lock(&self.stats).clone()
    }

    pub fn get_status(&self) -> DetectionStatus {
        let camera = self.source.status();
        let current_objects = lock(&self.tracker)
            .current_objects()
            .into_iter()
            .map(|(name, since)| (name, since.as_secs_f64()))
            .collect();

        DetectionStatus {
            running: self.is_running(),
            detector: self.detector_name.clone(),
            interval_secs: self.interval.as_secs_f64(),
            confidence: self.params.confidence,
            iou: self.params.iou,
            target_classes: self.params.target_classes.clone(),
            camera_running: camera.running,
            camera_service_active: self.source.is_active(),
            current_objects,
            stats: self.stats(),
        }
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[derive(Debug, PartialEq)]
enum Tick {
    Inactive,
    NoFrame,
    Failed,
    Processed,
}

/// 检测线程持有的状态
struct DetectionTicker {
    source: Arc<dyn FrameSource>,
    tracker: Arc<Mutex<EventTracker>>,
    detector: Arc<Mutex<Box<dyn Detector>>>,
    params: DetectionParams,
    stats: Arc<Mutex<DetectionStats>>,
}

impl DetectionTicker {
    fn run(self, token: CancelToken, interval: Duration) {
        debug!("🔍 检测线程启动");
        while !token.is_cancelled() {
            let started = Instant::now();

            if self.tick() == Tick::Inactive {
                if !token.sleep(interval) {
                    break;
                }
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed > interval {
                lock(&self.stats).overruns += 1;
                warn!("🐢 检测耗时 {:?} 超过间隔 {:?}", elapsed, interval);
            }
            if !token.sleep(interval.saturating_sub(elapsed)) {
                break;
            }
        }
        debug!("🔍 检测线程退出");
    }

    fn tick(&self) -> Tick {
        lock(&self.stats).ticks += 1;

        if !self.source.is_active() {
            lock(&self.stats).skipped_inactive += 1;
            debug!("⏸️ 摄像头未激活, 跳过本次检测");
            return Tick::Inactive;
        }

        let frame = match self.source.latest_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                lock(&self.stats).skipped_no_frame += 1;
                return Tick::NoFrame;
            }
            Err(e) => {
                lock(&self.stats).errors += 1;
                warn!("⚠️ 读取最新帧失败: {}", e);
                return Tick::Failed;
            }
        };

        let started = Instant::now();
        let image = frame.copy_image();
        let prediction = lock(&self.detector).detect(&image, &self.params);
        let prediction = match prediction {
            Ok(prediction) => prediction,
            Err(e) => {
                lock(&self.stats).errors += 1;
                if e.is_transient() {
                    warn!("⚠️ 检测失败 (帧 #{}): {}", frame.sequence(), e);
                } else {
                    error!("❌ 检测器异常 (帧 #{}): {}", frame.sequence(), e);
                }
                return Tick::Failed;
            }
        };

        // 没有检测结果时也要调用, 让超时离开按时触发
        let events = lock(&self.tracker).process_detections(&prediction.detections);

        let mut stats = lock(&self.stats);
        stats.events_emitted += events.len() as u64;
        stats.last_detections = prediction.detections.len();
        stats.last_processing_ms = started.elapsed().as_secs_f64() * 1000.0;
        stats.last_frame_sequence = Some(frame.sequence());
        if !prediction.detections.is_empty() {
            debug!(
                "🎯 帧 #{}: {} 个目标, 耗时 {:.1}ms",
                frame.sequence(),
                prediction.detections.len(),
                stats.last_processing_ms
            );
        }
        Tick::Processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, Prediction};
    use crate::error::Error;
    use crate::events::{EventType, MemoryEventSink};
    use crate::testing::StubSource;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::thread;

    /// 按脚本依次返回检测结果, 脚本用完后返回空
    struct ScriptedDetector {
        script: VecDeque<Result<Vec<&'static str>>>,
        seen_pixels: Arc<Mutex<Vec<u8>>>,
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn detect(&mut self, image: &RgbImage, _params: &DetectionParams) -> Result<Prediction> {
            lock(&self.seen_pixels).push(image.as_raw()[0]);
            let classes = self.script.pop_front().unwrap_or(Ok(Vec::new()))?;
            let detections = classes
                .into_iter()
                .map(|class_name| Detection {
                    class_id: 0,
                    class_name: class_name.to_string(),
                    confidence: 0.9,
                    bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
                })
                .collect();
            Ok(Prediction {
                annotated: image.clone(),
                detections,
            })
        }
    }

    fn config(interval_ms: u64) -> DetectionConfig {
        DetectionConfig {
            interval_ms,
            ..DetectionConfig::default()
        }
    }

    fn build(
        source: Arc<StubSource>,
        script: Vec<Result<Vec<&'static str>>>,
        timeout: Duration,
        interval_ms: u64,
    ) -> (DetectionLoop, Arc<MemoryEventSink>, Arc<Mutex<Vec<u8>>>) {
        let sink = Arc::new(MemoryEventSink::new());
        let tracker = Arc::new(Mutex::new(EventTracker::new(sink.clone(), timeout)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let detector = ScriptedDetector {
            script: script.into(),
            seen_pixels: Arc::clone(&seen),
        };
        let looper = DetectionLoop::new(source, tracker, Box::new(detector), &config(interval_ms));
        (looper, sink, seen)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn detections_become_enter_and_leave_events() {
        let source = Arc::new(StubSource::with_frame(7));
        let (looper, sink, _) = build(
            source.clone(),
            vec![Ok(vec!["cat"]), Ok(vec!["cat", "dog"])],
            Duration::from_millis(60),
            20,
        );
        looper.start().unwrap();
        assert_eq!(source.ensure_calls(), 1);

        wait_until(|| sink.len() >= 4);
        looper.stop().unwrap();

        let events: Vec<(EventType, String)> = sink
            .events()
            .into_iter()
            .map(|e| (e.event_type, e.class_name))
            .collect();
        assert_eq!(events[0], (EventType::EnteringArea, "cat".to_string()));
        assert_eq!(events[1], (EventType::EnteringArea, "dog".to_string()));
        assert!(events[2..]
            .iter()
            .all(|(kind, _)| *kind == EventType::LeavingArea));
        assert_eq!(looper.stats().last_frame_sequence, Some(7));
    }

    #[test]
    fn inactive_camera_skips_ticks() {
        let source = Arc::new(StubSource::with_frame(1));
        source.set_active(false);
        let (looper, sink, seen) = build(source, vec![Ok(vec!["cat"])], Duration::from_secs(3), 10);
        looper.start().unwrap();
        wait_until(|| looper.stats().skipped_inactive >= 3);
        looper.stop().unwrap();

        assert!(sink.is_empty());
        assert!(lock(&seen).is_empty());
        assert!(!looper.get_status().camera_service_active);
    }

    #[test]
    fn detector_errors_skip_the_tick() {
        let source = Arc::new(StubSource::with_frame(3));
        let (looper, sink, _) = build(
            source,
            vec![Err(Error::Detection("model crashed".into())), Ok(vec!["person"])],
            Duration::from_secs(3),
            10,
        );
        looper.start().unwrap();
        wait_until(|| sink.len() == 1);
        looper.stop().unwrap();

        assert!(looper.stats().errors >= 1);
        assert_eq!(sink.events()[0].class_name, "person");
    }

    #[test]
    fn no_frame_yet_is_skipped() {
        let source = Arc::new(StubSource::new());
        let (looper, sink, seen) = build(source, vec![], Duration::from_secs(3), 10);
        looper.start().unwrap();
        wait_until(|| looper.stats().skipped_no_frame >= 2);
        looper.stop().unwrap();
        assert!(sink.is_empty());
        assert!(lock(&seen).is_empty());
    }

    #[test]
    fn stop_leaves_camera_running_and_restart_works() {
        let source = Arc::new(StubSource::with_frame(2));
        let (looper, _, seen) = build(source.clone(), vec![], Duration::from_secs(3), 10);

        looper.start().unwrap();
        looper.start().unwrap();
        looper.stop().unwrap();
        looper.stop().unwrap();
        assert!(source.is_active());

        looper.start().unwrap();
        wait_until(|| !lock(&seen).is_empty());
        assert!(looper.get_status().running);
        looper.stop().unwrap();
        assert!(!looper.get_status().running);
    }

    struct SlowDetector {
        busy: Arc<AtomicBool>,
    }

    impl Detector for SlowDetector {
        fn name(&self) -> &str {
            "slow"
        }

        fn detect(&mut self, image: &RgbImage, _params: &DetectionParams) -> Result<Prediction> {
            self.busy.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(600));
            Ok(Prediction {
                annotated: image.clone(),
                detections: Vec::new(),
            })
        }
    }

    #[test]
    fn status_does_not_wait_for_a_running_detector() {
        let source = Arc::new(StubSource::with_frame(5));
        let sink = Arc::new(MemoryEventSink::new());
        let tracker = Arc::new(Mutex::new(EventTracker::new(sink, Duration::from_secs(3))));
        let busy = Arc::new(AtomicBool::new(false));
        let detector = SlowDetector {
            busy: Arc::clone(&busy),
        };
        let looper = DetectionLoop::new(source, tracker, Box::new(detector), &config(10));
        looper.start().unwrap();
        wait_until(|| busy.load(Ordering::SeqCst));

        let started = Instant::now();
        let status = looper.get_status();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(status.detector, "slow");
        looper.stop().unwrap();
    }

    #[test]
    fn status_lists_current_objects() {
        let source = Arc::new(StubSource::with_frame(4));
        let (looper, sink, _) = build(source, vec![Ok(vec!["dog"])], Duration::from_secs(30), 10);
        looper.start().unwrap();
        wait_until(|| sink.len() == 1);
        let status = looper.get_status();
        looper.stop().unwrap();

        assert!(status.current_objects.contains_key("dog"));
        assert_eq!(status.detector, "scripted");
        assert_eq!(status.target_classes, vec!["person", "cat", "dog"]);
    }
}
