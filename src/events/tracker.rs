// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 进出区域事件追踪
//!
//! 按类别名追踪 (不区分同类的多个个体), 每个类别两种状态:
//! - 不在区域: 首次出现 → 发出 `EnteringArea`, 记录最后出现时间
//! - 在区域: 再次出现只刷新最后出现时间; 超过 `timeout` 未出现 → 发出 `LeavingArea` 并移除
//!
//! 每次调用先发进入事件, 再发离开事件.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::sink::{EventSink, EventType};
use crate::detection::Detection;

/// 离开事件的置信度取值
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveConfidence {
    /// 固定值
    Fixed(f32),
    /// 最后一次出现时的置信度
    LastSeen,
}

impl Default for LeaveConfidence {
    fn default() -> Self {
        LeaveConfidence::Fixed(0.8)
    }
}

/// 进出事件
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AreaEvent {
    /// 持久化失败时为 None
    pub event_id: Option<i64>,
    pub event_type: EventType,
    pub class_name: String,
    pub confidence: f32,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Copy, Debug)]
struct Presence {
    last_seen: Instant,
    last_confidence: f32,
}

pub struct EventTracker {
    present: BTreeMap<String, Presence>,
    timeout: Duration,
    leave_confidence: LeaveConfidence,
    sink: Arc<dyn EventSink>,
}

impl EventTracker {
    pub fn new(sink: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self {
            present: BTreeMap::new(),
            timeout,
            leave_confidence: LeaveConfidence::default(),
            sink,
        }
    }

    pub fn with_leave_confidence(mut self, policy: LeaveConfidence) -> Self {
        self.leave_confidence = policy;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 处理一批检测结果 (可以为空, 仅用于判定超时离开)
    pub fn process_detections(&mut self, detections: &[Detection]) -> Vec<AreaEvent> {
        self.process_detections_at(detections, Instant::now())
    }

    /// 同上, 显式指定当前时刻
    pub fn process_detections_at(
        &mut self,
        detections: &[Detection],
        now: Instant,
    ) -> Vec<AreaEvent> {
        // 按类别分组, 保留本批最高置信度 (按首次出现顺序)
        let mut batch: Vec<(&str, f32)> = Vec::new();
        for det in detections {
            match batch.iter_mut().find(|(name, _)| *name == det.class_name) {
                Some((_, conf)) => *conf = conf.max(det.confidence),
                None => batch.push((det.class_name.as_str(), det.confidence)),
            }
        }

        let mut events = Vec::new();
        for &(class_name, confidence) in &batch {
            let presence = Presence {
                last_seen: now,
                last_confidence: confidence,
            };
            if self.present.insert(class_name.to_string(), presence).is_none() {
                events.push(self.emit(EventType::EnteringArea, class_name, confidence));
            }
        }

        let seen = |name: &str| batch.iter().any(|(n, _)| *n == name);
        let expired: Vec<(String, Presence)> = self
            .present
            .iter()
            .filter(|(name, p)| {
                !seen(name.as_str()) && now.saturating_duration_since(p.last_seen) >= self.timeout
            })
            .map(|(name, p)| (name.clone(), *p))
            .collect();
        for (class_name, presence) in expired {
            self.present.remove(&class_name);
            let confidence = match self.leave_confidence {
                LeaveConfidence::Fixed(c) => c,
                LeaveConfidence::LastSeen => presence.last_confidence,
            };
            events.push(self.emit(EventType::LeavingArea, &class_name, confidence));
        }

        events
    }

    /// 只判定超时离开
    pub fn check_for_leaving(&mut self, now: Instant) -> Vec<AreaEvent> {
        self.process_detections_at(&[], now)
    }

    /// 当前在区域内的类别及距最后出现的时间
    pub fn current_objects(&self) -> BTreeMap<String, Duration> {
        let now = Instant::now();
        self.present
            .iter()
            .map(|(name, p)| (name.clone(), now.saturating_duration_since(p.last_seen)))
            .collect()
    }

    pub fn is_present(&self, class_name: &str) -> bool {
        self.present.contains_key(class_name)
    }

    fn emit(&self, event_type: EventType, class_name: &str, confidence: f32) -> AreaEvent {
        let event_id = match self.sink.log_event(None, event_type, class_name, confidence) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("❌ 事件写入失败 ({} {}): {}", event_type, class_name, e);
                None
            }
        };

        let icon = match event_type {
            EventType::EnteringArea => "🐾",
            EventType::LeavingArea => "👋",
        };
        info!("{} {}: {} ({:.2})", icon, event_type, class_name, confidence);

        AreaEvent {
            event_id,
            event_type,
            class_name: class_name.to_string(),
            confidence,
            timestamp: Local::now(),
        }
    }
}
