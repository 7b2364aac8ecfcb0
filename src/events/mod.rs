// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 进出区域事件: 追踪 + 持久化

mod sink;
mod tracker;

pub use sink::{EventSink, EventType, JsonlEventLog, MemoryEventSink, StoredEvent};
pub use tracker::{AreaEvent, EventTracker, LeaveConfidence};
