// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 错误类型 (Error types)

use std::time::Duration;

/// Result 别名
pub type Result<T> = std::result::Result<T, Error>;

/// 监控核心的错误分类
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 摄像头打开/配置/启动失败, 交给调用方决定是否重试
    #[error("摄像头硬件错误: {0}")]
    Hardware(String),

    /// 单帧采集失败, 采集循环继续运行
    #[error("采集失败: {0}")]
    Capture(String),

    /// 外部检测器执行失败, 跳过本次检测
    #[error("检测失败: {0}")]
    Detection(String),

    /// 事件持久化失败
    #[error("事件写入失败: {0}")]
    Sink(String),

    #[error("摄像头未初始化")]
    NotInitialized,

    #[error("服务未激活: {0}")]
    NotActive(String),

    /// 并发观看者达到上限
    #[error("观看者已满: {0}")]
    OverCapacity(String),

    /// 停止请求已发出, 但工作线程在限定时间内没有退出
    #[error("线程 {worker} 在 {timeout:?} 内未退出")]
    ShutdownTimeout { worker: String, timeout: Duration },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("图像编码失败: {0}")]
    Encode(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 瞬时错误: 后台循环记录日志后继续
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Capture(_) | Error::Detection(_) | Error::Sink(_) | Error::Encode(_)
        )
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Encode(e.to_string())
    }
}
