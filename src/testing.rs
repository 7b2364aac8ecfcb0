// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 测试用帧来源

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use image::{Rgb, RgbImage};

use crate::camera::{CameraServiceStatus, Frame, FrameSource};
use crate::error::{Error, Result};
use crate::worker::lock;

/// 可控的帧来源: 激活状态/当前帧/读取失败都由测试设定
pub(crate) struct StubSource {
    active: AtomicBool,
    failing: AtomicBool,
    frame: Mutex<Option<Arc<Frame>>>,
    ensure_calls: AtomicUsize,
    reads: AtomicUsize,
}

impl StubSource {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            frame: Mutex::new(None),
            ensure_calls: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// 8x4 的单色帧, 像素值和序号都等于 `marker`
    pub(crate) fn with_frame(marker: u8) -> Self {
        let source = Self::new();
        source.set_frame(marker);
        source
    }

    pub(crate) fn set_frame(&self, marker: u8) {
        let image = RgbImage::from_pixel(8, 4, Rgb([marker, marker, marker]));
        *lock(&self.frame) = Some(Arc::new(Frame::new(image, Local::now(), marker as u64, None)));
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl FrameSource for StubSource {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn latest_frame(&self) -> Result<Option<Arc<Frame>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Capture("stub source failure".into()));
        }
        Ok(lock(&self.frame).clone())
    }

    fn status(&self) -> CameraServiceStatus {
        let frame = lock(&self.frame).clone();
        CameraServiceStatus {
            initialized: true,
            running: self.is_active(),
            active: self.is_active(),
            device: Some("stub".into()),
            resolution: (8, 4),
            frame_rate: 30,
            last_frame: frame.as_ref().map(|f| f.metadata()),
            frame_count: frame.map_or(0, |f| f.sequence() + 1),
            capture_errors: 0,
        }
    }
}
