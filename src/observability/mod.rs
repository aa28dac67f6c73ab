//! 可观测性
//!
//! 网关进程日志写 stdout；Worker 进程的 stdout 是 IPC 通道，日志只能写 stderr。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init() {
    tracing_subscriber::registry().with(filter()).with(fmt::layer()).init();
}

/// Worker 进程：写 stderr，不带颜色（通常被父进程继承到同一终端或日志文件）
pub fn init_worker() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();
}
