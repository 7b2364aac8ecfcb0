// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 事件持久化接口 + 两种实现 (内存 / JSON-lines 文件)

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::worker::lock;

/// 事件类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EnteringArea,
    LeavingArea,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EnteringArea => "entering_area",
            EventType::LeavingArea => "leaving_area",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已持久化的事件记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub pet_id: Option<i64>,
    pub event_type: EventType,
    pub class_name: String,
    pub confidence: f32,
    pub timestamp: DateTime<Local>,
}

/// 事件持久化 (同步调用, 可能失败)
pub trait EventSink: Send + Sync {
    /// 追加一条事件, 返回事件ID
    fn log_event(
        &self,
        pet_id: Option<i64>,
        event_type: EventType,
        class_name: &str,
        confidence: f32,
    ) -> Result<i64>;

    /// 最近的事件, 新的在前
    fn recent_events(&self, _limit: usize) -> Result<Vec<StoredEvent>> {
        Ok(Vec::new())
    }
}

/// 内存事件表
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn log_event(
        &self,
        pet_id: Option<i64>,
        event_type: EventType,
        class_name: &str,
        confidence: f32,
    ) -> Result<i64> {
        let mut events = lock(&self.events);
        let id = events.len() as i64 + 1;
        events.push(StoredEvent {
            id,
            pet_id,
            event_type,
            class_name: class_name.to_string(),
            confidence,
            timestamp: Local::now(),
        });
        Ok(id)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        Ok(lock(&self.events).iter().rev().take(limit).cloned().collect())
    }
}

/// 追加写入的 JSON-lines 事件日志
pub struct JsonlEventLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

struct LogState {
    file: File,
    next_id: i64,
}

impl JsonlEventLog {
    /// 打开(或创建)日志文件, 事件ID接着已有记录继续
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let existing = read_events(&path)?;
        let next_id = existing.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            "🗂️ 事件日志: {} (已有 {} 条记录)",
            path.display(),
            existing.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(LogState { file, next_id }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventLog {
    fn log_event(
        &self,
        pet_id: Option<i64>,
        event_type: EventType,
        class_name: &str,
        confidence: f32,
    ) -> Result<i64> {
        let mut state = lock(&self.state);
        let event = StoredEvent {
            id: state.next_id,
            pet_id,
            event_type,
            class_name: class_name.to_string(),
            confidence,
            timestamp: Local::now(),
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        state
            .file
            .write_all(line.as_bytes())
            .and_then(|_| state.file.flush())
            .map_err(|e| Error::Sink(format!("{}: {}", self.path.display(), e)))?;

        state.next_id += 1;
        Ok(event.id)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        // 持有写锁, 避免读到写了一半的行
        let _state = lock(&self.state);
        let mut events = read_events(&self.path)?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}

fn read_events(path: &Path) -> Result<Vec<StoredEvent>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("⚠️ 跳过损坏的事件记录 {}:{}: {}", path.display(), lineno + 1, e),
        }
    }
    Ok(events)
}
