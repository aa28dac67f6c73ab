//! Worker 子进程主循环
//!
//! 由 `switchboard worker --id N` 启动：从 stdin 读帧，stdout 写帧，日志走 stderr。
//! 单个 Worker 内请求严格串行。

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing::Instrument;

use super::protocol::{AgentResponse, FrameReader, FrameWriter, ParentFrame, WorkerFrame};
use super::runtime::AgentRuntime;
use crate::core::ProtocolError;

/// 以当前进程的 stdin/stdout 运行 Worker，直到收到 SHUTDOWN、EOF 或 Ctrl+C
pub async fn run_worker(worker_id: usize, runtime: AgentRuntime) -> Result<(), ProtocolError> {
    async move {
        tracing::info!(pid = std::process::id(), "Worker started");

        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();

        let result = tokio::select! {
            r = serve(stdin, stdout, &runtime) => r,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, worker exiting");
                Ok(())
            }
        };

        tracing::info!("Worker stopped");
        result
    }
    .instrument(tracing::info_span!("worker", id = worker_id))
    .await
}

/// 在任意读写端上服务请求（便于测试）
pub async fn serve<R, W>(reader: R, writer: W, runtime: &AgentRuntime) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    loop {
        let line = match reader.read_line().await {
            Ok(line) => line.to_string(),
            Err(ProtocolError::Closed) => {
                tracing::info!("Parent closed the channel");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let frame = match serde_json::from_str::<ParentFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                match recover_request_id(&line) {
                    Some(id) => {
                        tracing::warn!(request = %id, "Malformed request: {}", e);
                        let resp = AgentResponse::failure(id, format!("Malformed request: {e}"));
                        writer.write_frame(&WorkerFrame::Response(resp)).await?;
                    }
                    None => tracing::error!("Dropping unreadable frame: {}", e),
                }
                continue;
            }
        };

        match frame {
            ParentFrame::Shutdown => {
                tracing::info!("Shutdown requested");
                return Ok(());
            }
            ParentFrame::HealthCheck => {
                writer.write_frame(&WorkerFrame::HealthOk).await?;
            }
            ParentFrame::Request(request) => {
                let response = runtime.execute(&request).await;
                tracing::debug!(
                    request = %response.id,
                    success = response.success,
                    pushes = response.pending_pushes.len(),
                    ops = response.pending_scheduler_ops.len(),
                    "Request finished"
                );
                writer.write_frame(&WorkerFrame::Response(response)).await?;
            }
        }
    }
}

fn recover_request_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
