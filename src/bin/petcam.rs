// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 宠物监控服务
//!
//! 系统架构:
//! 1. 采集线程: 摄像头取帧, 只保留最新一帧
//! 2. 检测线程: 定时检测 → 进入/离开事件 → 事件日志
//! 3. 推流线程: 每个观看者一个 MJPEG 线程
//! 4. 主线程:   HTTP 服务 (tokio)

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mimalloc::MiMalloc;
use tracing::{error, info, warn};

use petcam_rs::camera::{list_devices, CameraSource};
use petcam_rs::{server, telemetry, AppConfig, AppServices};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    /// 内置测试画面 (无需硬件)
    Test,
    /// 本地摄像头
    Device,
}

/// 宠物监控参数 (覆盖配置文件)
#[derive(Parser, Debug)]
#[command(author, version, about = "宠物监控 - 实时画面与进出事件", long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "petcam.json")]
    config: String,

    /// 画面来源
    #[arg(short, long, value_enum)]
    source: Option<Source>,

    /// 摄像头序号
    #[arg(short, long)]
    device: Option<usize>,

    /// HTTP 监听地址
    #[arg(short, long)]
    bind: Option<String>,

    /// 检测模型 (ONNX)
    #[arg(short, long)]
    model: Option<String>,

    /// 不启动检测循环
    #[arg(long)]
    no_detection: bool,

    /// 不开启推流
    #[arg(long)]
    no_streaming: bool,

    /// 列出可用摄像头后退出
    #[arg(long)]
    list_devices: bool,

    /// 默认日志级别 (RUST_LOG 优先)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        match (self.source, self.device) {
            (Some(Source::Test), _) => config.camera.source = CameraSource::TestPattern,
            (Some(Source::Device), index) => {
                config.camera.source = CameraSource::Device {
                    index: index.unwrap_or(0),
                }
            }
            (None, Some(index)) => config.camera.source = CameraSource::Device { index },
            (None, None) => {}
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(model) = &self.model {
            config.detection.model_path = model.clone();
        }
        if self.no_detection {
            config.detection.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_level);

    if args.list_devices {
        let devices = list_devices();
        if devices.is_empty() {
            println!("未发现摄像头");
        }
        for (index, name) in devices {
            println!("[{}] {}", index, name);
        }
        return Ok(());
    }

    let mut config = AppConfig::load(&args.config);
    args.apply(&mut config);
    config.print_summary();

    info!("🚀 宠物监控启动");
    let services = Arc::new(AppServices::init(&config).context("服务初始化失败")?);

    // 摄像头启动失败不退出, 可以稍后通过接口重试
    let detection = config.detection.enabled;
    let streaming = !args.no_streaming;
    let starting = Arc::clone(&services);
    match tokio::task::spawn_blocking(move || starting.start(detection, streaming)).await? {
        Ok(()) => info!("✅ 服务已启动"),
        Err(e) => warn!("⚠️ 启动失败: {} (可通过 /api/stream/start 重试)", e),
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ 无法监听退出信号: {}", e);
        }
        info!("🛑 收到退出信号");
    };
    let served = server::serve(Arc::clone(&services), &config.server.bind, shutdown).await;

    let stopping = Arc::clone(&services);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await?
        .context("服务关闭失败")?;
    served.context("HTTP 服务异常退出")?;
    Ok(())
}
