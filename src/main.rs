//! switchboard - 消息路由网关
//!
//! 运行方式：
//! ```bash
//! switchboard serve --config config/default.toml
//! ```
//! `worker --id N` 是进程池重新执行自身时使用的入口，不需要手动运行。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use switchboard::config::{load_config, AppConfig, ProcessMode};
use switchboard::core::{
    AgentLoopCleanup, BusCleanup, PoolCleanup, SchedulerCleanup, ShutdownCoordinator, ShutdownManager,
};
use switchboard::gateway::{AgentLoop, Dispatcher, LocalScheduler, MessageBus, RemoteToolBridge};
use switchboard::observability;
use switchboard::worker::{run_worker, AgentClient, AgentRuntime, EchoAgent, ToolRegistry, WorkerCommand, WorkerPool, DEFAULT_AGENT};

#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about = "消息路由与进程隔离的 Agent 执行网关")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行网关
    Serve {
        /// 额外的配置文件（覆盖 config/default.toml）
        #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Worker 子进程入口（stdin/stdout 为 IPC 通道）
    Worker {
        #[arg(long)]
        id: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Worker { id } => {
            observability::init_worker();
            run_worker(id, AgentRuntime::builtin())
                .await
                .with_context(|| format!("Worker {id} failed"))
        }
        Command::Serve { config } => {
            observability::init();
            let config = load_config(config).context("Failed to load config")?;
            config.validate().context("Invalid config")?;
            serve(config).await
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));

    let bus = Arc::new(MessageBus::new());
    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.rpc_timeout()));
    let scheduler = LocalScheduler::new(Arc::clone(&dispatcher));

    let mut pool = None;
    let client = match config.agent.process_mode {
        ProcessMode::Embedded => {
            let mut tools = ToolRegistry::with_builtins();
            tools.register(RemoteToolBridge::new(Arc::clone(&dispatcher)));
            let mut runtime = AgentRuntime::new(tools);
            runtime.register_agent(EchoAgent::new(DEFAULT_AGENT));
            AgentClient::embedded(runtime)
        }
        ProcessMode::Worker => {
            let command = WorkerCommand::current_exe().context("Cannot locate current executable")?;
            let worker_pool = Arc::new(WorkerPool::new(config.pool.to_settings(), command)?);
            worker_pool.start().await.context("Failed to start worker pool")?;
            pool = Some(Arc::clone(&worker_pool));
            AgentClient::pooled(worker_pool)
        }
    };
    tracing::info!(mode = client.mode(), "Agent client ready");

    let agent_loop = Arc::new(
        AgentLoop::new(Arc::clone(&bus), Arc::clone(&dispatcher), client.clone(), config.agent.to_settings())
            .with_scheduler(Arc::new(scheduler.clone())),
    );
    agent_loop.start();

    #[cfg(feature = "gateway")]
    let (server, http) = {
        let settings = config.gateway.to_settings();
        let server = switchboard::gateway::GatewayServer::new(
            settings.clone(),
            Arc::clone(&bus),
            Arc::clone(&dispatcher),
            client.clone(),
        );
        server.start().await.context("Failed to start gateway server")?;
        let http = switchboard::gateway::HttpApi::new(settings, Arc::clone(&bus), Arc::clone(&dispatcher), client);
        http.start().await.context("Failed to start HTTP API")?;
        (server, http)
    };

    tracing::info!("Press Ctrl+C to stop");
    manager.wait_for_shutdown().await;

    #[cfg(feature = "gateway")]
    {
        server.stop();
        http.stop();
    }

    coordinator.register(AgentLoopCleanup(agent_loop));
    coordinator.register(BusCleanup(bus));
    coordinator.register(SchedulerCleanup(scheduler));
    if let Some(pool) = pool {
        coordinator.register(PoolCleanup(pool));
    }
    coordinator.run_cleanup().await;

    Ok(())
}
