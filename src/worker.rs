// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 后台工作线程 + 取消令牌
//!
//! 采集线程和检测线程都通过 `Worker` 启动:
//! - `CancelToken::sleep` 可被停止信号立即唤醒
//! - `Worker::shutdown` 有界等待线程退出, 超时返回错误并保留句柄, 可再次重试

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, warn};

use crate::error::{Error, Result};

/// 加锁 (线程 panic 导致的中毒锁直接取回内部数据)
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 取消令牌 (工作线程持有)
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 可中断睡眠, 返回 false 表示已收到停止信号
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            // 发送端被丢弃 = 已取消
            _ => false,
        }
    }
}

/// 后台工作线程句柄
pub struct Worker {
    name: String,
    cancelled: Arc<AtomicBool>,
    cancel_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// 启动命名线程
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let token = CancelToken {
            cancelled: Arc::clone(&cancelled),
            wake: cancel_rx,
        };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // 线程结束(包括panic展开)时丢弃, 通知 shutdown
                let _done_guard = done_tx;
                body(token);
            })?;

        Ok(Self {
            name: name.to_string(),
            cancelled,
            cancel_tx: Some(cancel_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// 发出停止信号 (不等待)
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_tx.take();
    }

    /// 发出停止信号并有界等待线程退出
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.cancel();

        if let Err(RecvTimeoutError::Timeout) = self.done_rx.recv_timeout(timeout) {
            error!("⏱️ 线程 {} 在 {:?} 内未响应停止请求", self.name, timeout);
            return Err(Error::ShutdownTimeout {
                worker: self.name.clone(),
                timeout,
            });
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("⚠️ 线程 {} 以 panic 结束", self.name);
            }
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel();
    }
}
