// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 实时推流 (MJPEG)

pub mod mjpeg;
mod multiplexer;

pub use multiplexer::{MjpegStream, StreamingMultiplexer, StreamingStatus};
