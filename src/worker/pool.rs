//! WorkerPool - 固定数量的 Worker 子进程
//!
//! - 可用队列：空闲 Worker id 的队列，充当计数信号量，把并发上限限制在 N
//! - `submit`：取空闲 Worker → 发送请求 → 带超时等待响应 → 归还 Worker（无论成功与否）
//! - 健康监控：周期性检查进程存活并 ping 空闲 Worker，崩溃的按退避策略重启，超出预算的槽位永久移除
//!
//! 超时或被取消的请求不会打断 Worker：槽位照常归还，迟到的响应之后按 id 丢弃。
//! 只有进程退出、管道损坏或 ping 不通才计入重启预算。
//!
//! 槽位状态：`Available → Busy → (Available | Dead) → Restarting → Available`

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::protocol::{AgentRequest, AgentResponse, FrameReader, FrameWriter, ParentFrame, WorkerFrame};
use crate::core::{Backoff, BackoffPolicy, PoolError, ProtocolError};

/// 传给 Worker 子进程的环境变量：槽位 id
pub const WORKER_ID_ENV: &str = "SWITCHBOARD_WORKER_ID";

/// 池运行参数
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    /// Worker 内部等待响应的上限
    pub response_timeout: Duration,
    /// 外层超时 = response_timeout + response_margin
    pub response_margin: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub shutdown_grace: Duration,
    /// 重启退避：max_attempts 即重启预算，reset_after 即冷却窗口
    pub restart_policy: BackoffPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 2,
            response_timeout: Duration::from_secs(120),
            response_margin: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(180),
            health_check_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            restart_policy: BackoffPolicy {
                max_attempts: 5,
                reset_after: Duration::from_secs(60),
                ..BackoffPolicy::default()
            },
        }
    }
}

/// 如何启动一个 Worker 进程；实际命令行会追加 `--id N`
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// 重新执行当前可执行文件的 `worker` 子命令
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, worker_id: usize) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--id")
            .arg(worker_id.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn()
    }
}

struct WorkerIo {
    writer: FrameWriter<ChildStdin>,
    reader: FrameReader<BufReader<ChildStdout>>,
    /// 已发出但还没读到响应的请求数（被放弃的请求仍在 Worker 里执行）
    outstanding: usize,
}

/// 一个 Worker 进程及其管道
struct WorkerHandle {
    pid: Option<u32>,
    child: std::sync::Mutex<Option<Child>>,
    /// 取走即关闭 stdin
    io: Mutex<Option<WorkerIo>>,
}

impl WorkerHandle {
    fn spawn(worker_id: usize, command: &WorkerCommand) -> Result<Self, PoolError> {
        let mut child = command
            .spawn(worker_id)
            .map_err(|source| PoolError::Spawn { worker_id, source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(PoolError::Spawn {
                worker_id,
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker pipes unavailable"),
            });
        };

        Ok(Self {
            pid: child.id(),
            child: std::sync::Mutex::new(Some(child)),
            io: Mutex::new(Some(WorkerIo {
                writer: FrameWriter::new(stdin),
                reader: FrameReader::new(BufReader::new(stdout)),
                outstanding: 0,
            })),
        })
    }

    fn with_child<T>(&self, f: impl FnOnce(&mut Option<Child>) -> T) -> T {
        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn is_alive(&self) -> bool {
        self.with_child(|child| match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        })
    }

    fn kill(&self) {
        self.with_child(|child| {
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
            }
        });
    }

    fn take_child(&self) -> Option<Child> {
        self.with_child(Option::take)
    }
}

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Available,
    Busy,
    Dead,
    Restarting,
}

struct WorkerSlot {
    handle: Arc<WorkerHandle>,
    state: SlotState,
    restarts: Backoff,
    last_health: DateTime<Utc>,
}

/// 单个 Worker 的状态
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub pid: Option<u32>,
    pub alive: bool,
    pub restart_count: u32,
    pub state: SlotState,
    pub last_health: DateTime<Utc>,
}

/// 池状态（运维查询用；槽位缩减只在这里可见）
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub started: bool,
    pub shutting_down: bool,
    pub configured_size: usize,
    pub live_count: usize,
    pub workers: BTreeMap<usize, WorkerStatus>,
}

struct PoolInner {
    settings: PoolSettings,
    command: WorkerCommand,
    slots: Mutex<HashMap<usize, WorkerSlot>>,
    queue_tx: mpsc::UnboundedSender<usize>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
    /// 剩余槽位数；降为 0 时唤醒所有等待者
    slot_count_tx: watch::Sender<usize>,
    slot_count_rx: watch::Receiver<usize>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Worker 进程池
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, command: WorkerCommand) -> Result<Self, PoolError> {
        if settings.size == 0 {
            return Err(PoolError::InvalidConfig("pool size must be at least 1".to_string()));
        }
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (slot_count_tx, slot_count_rx) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(PoolInner {
                settings,
                command,
                slots: Mutex::new(HashMap::new()),
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                slot_count_tx,
                slot_count_rx,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// 启动全部 Worker 与健康监控
    pub async fn start(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.started.load(Ordering::SeqCst) {
            tracing::warn!("WorkerPool already started");
            return Ok(());
        }
        if inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let size = inner.settings.size;
        tracing::info!(size, "Starting WorkerPool");

        {
            let mut slots = inner.slots.lock().await;
            for worker_id in 0..size {
                let handle = match WorkerHandle::spawn(worker_id, &inner.command) {
                    Ok(handle) => handle,
                    Err(e) => {
                        for slot in slots.values() {
                            slot.handle.kill();
                        }
                        slots.clear();
                        return Err(e);
                    }
                };
                tracing::info!(worker = worker_id, pid = ?handle.pid, "Worker spawned");
                slots.insert(
                    worker_id,
                    WorkerSlot {
                        handle: Arc::new(handle),
                        state: SlotState::Available,
                        restarts: Backoff::new(inner.settings.restart_policy.clone()),
                        last_health: Utc::now(),
                    },
                );
            }
        }

        for worker_id in 0..size {
            inner.enqueue(worker_id);
        }
        inner.slot_count_tx.send_replace(size);
        inner.started.store(true, Ordering::SeqCst);

        let monitor = tokio::spawn(Arc::clone(inner).monitor());
        *self.monitor.lock().await = Some(monitor);

        tracing::info!("WorkerPool started");
        Ok(())
    }

    /// 提交请求；没有空闲 Worker 时挂起（自然背压）
    ///
    /// 超时后调用方放弃等待，但 Worker 内的执行不会被打断，它的结果之后按 id 丢弃。
    pub async fn submit(&self, request: AgentRequest) -> Result<AgentResponse, PoolError> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) {
            return Err(PoolError::NotStarted);
        }
        if inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let lease = inner.acquire().await?;
        let worker_id = lease.worker_id;
        let request_id = request.id.clone();
        tracing::debug!(worker = worker_id, request = %request_id, "Dispatching request");

        let settings = &inner.settings;
        let outer = settings.response_timeout + settings.response_margin;
        let result = match tokio::time::timeout(outer, inner.exchange(worker_id, &lease.handle, request)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout {
                worker_id,
                timeout: settings.response_timeout,
            }),
        };

        let connection_ok = !matches!(
            result,
            Err(PoolError::ConnectionLost(_)) | Err(PoolError::Protocol { .. })
        );
        lease.release(connection_ok).await;

        if let Err(e) = &result {
            tracing::error!(worker = worker_id, request = %request_id, "Submit failed: {}", e);
        }
        result
    }

    pub async fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let slots = inner.slots.lock().await;
        let workers: BTreeMap<usize, WorkerStatus> = slots
            .iter()
            .map(|(id, slot)| {
                (
                    *id,
                    WorkerStatus {
                        pid: slot.handle.pid,
                        alive: slot.handle.is_alive(),
                        restart_count: slot.restarts.attempts(),
                        state: slot.state,
                        last_health: slot.last_health,
                    },
                )
            })
            .collect();

        PoolStatus {
            started: inner.started.load(Ordering::SeqCst),
            shutting_down: inner.shutdown.is_cancelled(),
            configured_size: inner.settings.size,
            live_count: workers.values().filter(|w| w.alive).count(),
            workers,
        }
    }

    /// 发送 SHUTDOWN，宽限期内未退出则强制终止；管道总是关闭
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) || inner.shutdown.is_cancelled() {
            return;
        }

        tracing::info!("Shutting down WorkerPool...");
        inner.shutdown.cancel();

        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.await;
        }

        let slots: Vec<(usize, WorkerSlot)> = inner.slots.lock().await.drain().collect();
        inner.slot_count_tx.send_replace(0);

        let grace = inner.settings.shutdown_grace;
        futures_util::future::join_all(
            slots
                .into_iter()
                .map(|(worker_id, slot)| stop_worker(worker_id, slot.handle, grace)),
        )
        .await;

        inner.started.store(false, Ordering::SeqCst);
        tracing::info!("WorkerPool shutdown complete");
    }
}

impl PoolInner {
    fn enqueue(&self, worker_id: usize) {
        // 接收端与发送端同属 PoolInner，发送不会失败
        let _ = self.queue_tx.send(worker_id);
    }

    /// 从可用队列取一个 id；所有槽位都被移除时返回 NoWorkers
    async fn next_available(&self) -> Result<usize, PoolError> {
        let mut slot_count = self.slot_count_rx.clone();
        let mut queue = self.queue_rx.lock().await;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(PoolError::ShuttingDown);
            }
            if *slot_count.borrow_and_update() == 0 {
                return Err(PoolError::NoWorkers);
            }
            tokio::select! {
                id = queue.recv() => return id.ok_or(PoolError::ShuttingDown),
                changed = slot_count.changed() => {
                    if changed.is_err() {
                        return Err(PoolError::ShuttingDown);
                    }
                }
                _ = self.shutdown.cancelled() => return Err(PoolError::ShuttingDown),
            }
        }
    }

    /// 占用一个空闲且存活的 Worker
    ///
    /// 队列里可能残留已失效的 id（槽位被移除或正在重启），取到后直接跳过。
    async fn acquire(self: &Arc<Self>) -> Result<Lease, PoolError> {
        loop {
            let worker_id = self.next_available().await?;
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(&worker_id) else {
                continue;
            };
            if slot.state != SlotState::Available {
                continue;
            }
            if !slot.handle.is_alive() {
                drop(slots);
                tracing::warn!(worker = worker_id, "Worker not alive, respawning before use");
                self.restart(worker_id).await;
                continue;
            }
            slot.state = SlotState::Busy;
            return Ok(Lease {
                inner: Arc::clone(self),
                worker_id,
                handle: Arc::clone(&slot.handle),
                released: false,
            });
        }
    }

    async fn exchange(
        &self,
        worker_id: usize,
        handle: &WorkerHandle,
        request: AgentRequest,
    ) -> Result<AgentResponse, PoolError> {
        let mut io = handle.io.lock().await;
        let io = io.as_mut().ok_or(PoolError::ConnectionLost(worker_id))?;

        let request_id = request.id.clone();
        io.writer
            .write_frame(&ParentFrame::Request(request))
            .await
            .map_err(|e| protocol_error(worker_id, e))?;
        io.outstanding += 1;

        let timeout = self.settings.response_timeout;
        let read = async {
            loop {
                match io.reader.read_frame::<WorkerFrame>().await {
                    Ok(WorkerFrame::Response(resp)) => {
                        io.outstanding = io.outstanding.saturating_sub(1);
                        if resp.id == request_id {
                            return Ok(resp);
                        }
                        tracing::warn!(worker = worker_id, request = %resp.id, "Discarding stale response");
                    }
                    Ok(WorkerFrame::HealthOk) => {}
                    Err(ProtocolError::Serialize(e)) => {
                        tracing::warn!(worker = worker_id, "Discarding unreadable frame: {}", e);
                    }
                    Err(e) => return Err(protocol_error(worker_id, e)),
                }
            }
        };

        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout { worker_id, timeout }),
        }
    }

    /// 归还 Worker：存活则放回可用队列，否则标记 Dead 并立即安排重启
    async fn release(self: &Arc<Self>, worker_id: usize, handle: &Arc<WorkerHandle>, connection_ok: bool) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&worker_id) else {
            return;
        };
        if !Arc::ptr_eq(&slot.handle, handle) || slot.state != SlotState::Busy {
            return;
        }

        if connection_ok && handle.is_alive() {
            slot.state = SlotState::Available;
            drop(slots);
            self.enqueue(worker_id);
            return;
        }

        slot.state = SlotState::Dead;
        handle.kill();
        drop(slots);
        tracing::warn!(worker = worker_id, "Worker lost during request, scheduling restart");
        if !self.shutdown.is_cancelled() {
            self.spawn_restart(worker_id);
        }
    }

    fn spawn_restart(self: &Arc<Self>, worker_id: usize) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.restart(worker_id).await });
    }

    /// 按退避策略重启槽位；超出预算则永久移除
    async fn restart(self: &Arc<Self>, worker_id: usize) {
        let delay = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(&worker_id) else {
                return;
            };
            if !matches!(slot.state, SlotState::Available | SlotState::Dead) {
                return;
            }
            match slot.restarts.next_delay() {
                Some(delay) => {
                    slot.state = SlotState::Restarting;
                    delay
                }
                None => {
                    let attempts = slot.restarts.attempts();
                    if let Some(removed) = slots.remove(&worker_id) {
                        removed.handle.kill();
                    }
                    self.slot_count_tx.send_replace(slots.len());
                    tracing::error!(
                        worker = worker_id,
                        attempts,
                        remaining = slots.len(),
                        "Worker exceeded restart budget, slot removed"
                    );
                    return;
                }
            }
        };

        tracing::warn!(worker = worker_id, delay_ms = delay.as_millis() as u64, "Restarting worker");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => return,
        }

        match WorkerHandle::spawn(worker_id, &self.command) {
            Ok(handle) => {
                let pid = handle.pid;
                let mut slots = self.slots.lock().await;
                let Some(slot) = slots.get_mut(&worker_id) else {
                    handle.kill();
                    return;
                };
                let old = std::mem::replace(&mut slot.handle, Arc::new(handle));
                old.kill();
                slot.state = SlotState::Available;
                slot.last_health = Utc::now();
                let attempts = slot.restarts.attempts();
                drop(slots);

                self.enqueue(worker_id);
                tracing::info!(worker = worker_id, pid = ?pid, attempts, "Worker respawned");
            }
            Err(e) => {
                tracing::error!(worker = worker_id, "{}", e);
                if let Some(slot) = self.slots.lock().await.get_mut(&worker_id) {
                    slot.state = SlotState::Dead;
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }
            self.check_workers().await;
        }
        tracing::debug!("Worker monitor stopped");
    }

    async fn check_workers(self: &Arc<Self>) {
        let snapshot: Vec<(usize, SlotState, Arc<WorkerHandle>)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.state, Arc::clone(&slot.handle)))
            .collect();

        for (worker_id, state, handle) in snapshot {
            if self.shutdown.is_cancelled() {
                return;
            }
            match state {
                SlotState::Available if handle.is_alive() => match self.ping(worker_id, &handle).await {
                    Some(true) => {
                        if let Some(slot) = self.slots.lock().await.get_mut(&worker_id) {
                            if Arc::ptr_eq(&slot.handle, &handle) {
                                slot.last_health = Utc::now();
                            }
                        }
                    }
                    Some(false) => {
                        tracing::warn!(worker = worker_id, "Worker failed health check, killing");
                        self.mark_dead(worker_id, &handle).await;
                        self.spawn_restart(worker_id);
                    }
                    None => {}
                },
                SlotState::Available | SlotState::Dead => {
                    tracing::warn!(worker = worker_id, "Worker died, attempting restart");
                    self.spawn_restart(worker_id);
                }
                SlotState::Busy | SlotState::Restarting => {}
            }
        }
    }

    async fn mark_dead(&self, worker_id: usize, handle: &Arc<WorkerHandle>) {
        if let Some(slot) = self.slots.lock().await.get_mut(&worker_id) {
            if Arc::ptr_eq(&slot.handle, handle) && slot.state == SlotState::Available {
                slot.state = SlotState::Dead;
            }
        }
        handle.kill();
    }

    /// ping 空闲 Worker；管道正被占用时返回 None（跳过本轮）
    ///
    /// 还有被放弃的请求在执行时先尝试读走它的响应；读不完说明 Worker 仍在忙，本轮同样跳过。
    async fn ping(&self, worker_id: usize, handle: &WorkerHandle) -> Option<bool> {
        let Ok(mut io) = handle.io.try_lock() else {
            return None;
        };
        let Some(io) = io.as_mut() else {
            return Some(false);
        };

        let timeout = self.settings.health_check_timeout;
        if io.outstanding > 0 {
            match tokio::time::timeout(timeout, drain_abandoned(io)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(worker = worker_id, "Pipe broken while draining abandoned response: {}", e);
                    return Some(false);
                }
                Err(_) => {
                    tracing::debug!(
                        worker = worker_id,
                        outstanding = io.outstanding,
                        "Abandoned request still running, skipping health check"
                    );
                    return None;
                }
            }
        }

        Some(matches!(tokio::time::timeout(timeout, health_check(io)).await, Ok(Ok(()))))
    }
}

/// 读走被放弃请求的响应，直到没有未完成的请求
async fn drain_abandoned(io: &mut WorkerIo) -> Result<(), ProtocolError> {
    while io.outstanding > 0 {
        match io.reader.read_frame::<WorkerFrame>().await {
            Ok(WorkerFrame::Response(stale)) => {
                io.outstanding -= 1;
                tracing::debug!(request = %stale.id, "Discarding abandoned response");
            }
            Ok(WorkerFrame::HealthOk) => {}
            Err(ProtocolError::Serialize(e)) => tracing::warn!("Discarding unreadable frame: {}", e),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn health_check(io: &mut WorkerIo) -> Result<(), ProtocolError> {
    io.writer.write_frame(&ParentFrame::HealthCheck).await?;
    loop {
        match io.reader.read_frame::<WorkerFrame>().await? {
            WorkerFrame::HealthOk => return Ok(()),
            WorkerFrame::Response(stale) => {
                io.outstanding = io.outstanding.saturating_sub(1);
                tracing::debug!(request = %stale.id, "Discarding stale response during health check");
            }
        }
    }
}

/// 对占用中 Worker 的租约：提交方在任何退出路径上都会归还（被取消时在 Drop 中归还）
///
/// 被取消不代表 Worker 出错：它会把请求执行完，响应之后被丢弃，所以照常放回可用队列。
struct Lease {
    inner: Arc<PoolInner>,
    worker_id: usize,
    handle: Arc<WorkerHandle>,
    released: bool,
}

impl Lease {
    async fn release(mut self, connection_ok: bool) {
        self.released = true;
        self.inner.release(self.worker_id, &self.handle, connection_ok).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let handle = Arc::clone(&self.handle);
            let worker_id = self.worker_id;
            tracing::debug!(worker = worker_id, "Submit abandoned by caller, returning worker");
            runtime.spawn(async move { inner.release(worker_id, &handle, true).await });
        }
    }
}

fn protocol_error(worker_id: usize, e: ProtocolError) -> PoolError {
    match e {
        ProtocolError::Closed => PoolError::ConnectionLost(worker_id),
        ProtocolError::Io(ref io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
            PoolError::ConnectionLost(worker_id)
        }
        other => PoolError::Protocol {
            worker_id,
            source: other,
        },
    }
}

async fn stop_worker(worker_id: usize, handle: Arc<WorkerHandle>, grace: Duration) {
    // 忙碌中的 Worker 持有管道锁，等不到就直接走强制终止
    match tokio::time::timeout(grace, handle.io.lock()).await {
        Ok(mut io) => {
            if let Some(mut io) = io.take() {
                if let Err(e) = io.writer.write_frame(&ParentFrame::Shutdown).await {
                    tracing::debug!(worker = worker_id, "Failed to send shutdown: {}", e);
                }
            }
        }
        Err(_) => tracing::warn!(worker = worker_id, "Worker busy, skipping shutdown message"),
    }

    let Some(mut child) = handle.take_child() else {
        return;
    };
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(worker = worker_id, %status, "Worker exited"),
        Ok(Err(e)) => tracing::warn!(worker = worker_id, "Failed to wait for worker: {}", e),
        Err(_) => {
            tracing::warn!(worker = worker_id, "Worker didn't exit gracefully, killing...");
            if let Err(e) = child.kill().await {
                tracing::error!(worker = worker_id, "Failed to kill worker: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    /// 用 sh 模拟的 Worker：每个请求耗时 200ms，原样回 ok
    const FAKE_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"kind":"shutdown"'*) exit 0 ;;
    *'"kind":"health_check"'*) echo '{"kind":"health_ok"}' ;;
    *)
      id=$(printf '%s' "$line" | sed -E 's/.*"id":"([^"]*)".*/\1/')
      sleep 0.2
      printf '{"kind":"response","id":"%s","success":true,"text":"ok"}\n' "$id"
      ;;
  esac
done
"#;

    /// 内容为 `slow` 的请求耗时 1s，完成后创建 $MARKER；其余请求立即回复；ping 与请求串行处理
    const SLOW_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"kind":"shutdown"'*) exit 0 ;;
    *'"kind":"health_check"'*) echo '{"kind":"health_ok"}' ;;
    *)
      id=$(printf '%s' "$line" | sed -E 's/.*"id":"([^"]*)".*/\1/')
      case "$line" in
        *'"user_text":"slow"'*) sleep 1; touch "$MARKER" ;;
      esac
      printf '{"kind":"response","id":"%s","success":true,"text":"done"}\n' "$id"
      ;;
  esac
done
"#;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script).arg("sh")
    }

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            response_timeout: Duration::from_secs(5),
            response_margin: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            restart_policy: BackoffPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 2,
                ..BackoffPolicy::default()
            },
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            WorkerPool::new(settings(0), sh("true")),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_before_start() {
        let pool = WorkerPool::new(settings(1), sh(FAKE_WORKER)).unwrap();
        let err = pool.submit(AgentRequest::new("default", "hi")).await.unwrap_err();
        assert!(matches!(err, PoolError::NotStarted));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let pool = WorkerPool::new(settings(2), WorkerCommand::new("/nonexistent/switchboard-worker")).unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { worker_id: 0, .. }));
        assert!(pool.status().await.workers.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_pool_size() {
        let pool = Arc::new(WorkerPool::new(settings(2), sh(FAKE_WORKER)).unwrap());
        pool.start().await.unwrap();

        let started = Instant::now();
        let calls: Vec<_> = (0..4)
            .map(|i| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.submit(AgentRequest::new("default", format!("m{i}"))).await })
            })
            .collect();
        for call in calls {
            let resp = call.await.unwrap().unwrap();
            assert!(resp.success);
            assert_eq!(resp.text, "ok");
        }
        // 2 个 Worker、4 个 200ms 请求：至少需要两轮
        assert!(started.elapsed() >= Duration::from_millis(400));

        let status = pool.status().await;
        assert_eq!(status.live_count, 2);
        assert!(status.workers.values().all(|w| w.state == SlotState::Available));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_keeps_live_worker() {
        let mut s = settings(1);
        s.response_timeout = Duration::from_millis(100);
        s.response_margin = Duration::from_millis(50);
        let pool = WorkerPool::new(s, sh("exec cat > /dev/null")).unwrap();
        pool.start().await.unwrap();

        let err = pool.submit(AgentRequest::new("default", "hi")).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { worker_id: 0, .. }));

        let status = pool.status().await;
        assert_eq!(status.workers[&0].state, SlotState::Available);
        assert!(status.workers[&0].alive);
        pool.shutdown().await;

        let status = pool.status().await;
        assert!(!status.started);
        assert!(status.shutting_down);
        assert!(status.workers.is_empty());
    }

    async fn wait_for(path: &std::path::Path, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        path.exists()
    }

    #[tokio::test]
    async fn test_abandoned_submits_keep_worker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let pool = WorkerPool::new(settings(1), sh(SLOW_WORKER).env("MARKER", &marker)).unwrap();
        pool.start().await.unwrap();
        let pid = pool.status().await.workers[&0].pid;

        for _ in 0..3 {
            let abandoned =
                tokio::time::timeout(Duration::from_millis(100), pool.submit(AgentRequest::new("default", "slow")))
                    .await;
            assert!(abandoned.is_err());
        }

        // 放弃不算崩溃：槽位还在，进程没换，也没有消耗重启预算
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = pool.status().await;
        let worker = &status.workers[&0];
        assert!(worker.alive);
        assert_eq!(worker.pid, pid);
        assert_eq!(worker.restart_count, 0);
        assert_eq!(worker.state, SlotState::Available);

        // 被放弃的请求照常执行完
        assert!(wait_for(&marker, Duration::from_secs(3)).await);

        let resp = pool.submit(AgentRequest::new("default", "fast")).await.unwrap();
        assert_eq!(resp.text, "done");
        assert_eq!(pool.status().await.workers[&0].restart_count, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_waits_for_abandoned_request() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let mut s = settings(1);
        s.response_timeout = Duration::from_millis(100);
        s.response_margin = Duration::from_millis(50);
        s.health_check_interval = Duration::from_millis(300);
        s.health_check_timeout = Duration::from_millis(200);
        let pool = WorkerPool::new(s, sh(SLOW_WORKER).env("MARKER", &marker)).unwrap();
        pool.start().await.unwrap();
        let pid = pool.status().await.workers[&0].pid;

        let err = pool.submit(AgentRequest::new("default", "slow")).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { worker_id: 0, .. }));

        // 跨过几轮健康检查：Worker 忙着执行被放弃的请求，不能被当成卡死
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(marker.exists());
        let status = pool.status().await;
        let worker = &status.workers[&0];
        assert!(worker.alive);
        assert_eq!(worker.pid, pid);
        assert_eq!(worker.restart_count, 0);

        let resp = pool.submit(AgentRequest::new("default", "fast")).await.unwrap();
        assert_eq!(resp.text, "done");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        // 第一条请求故意回一个错误 id，随后才回正确的
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -E 's/.*"id":"([^"]*)".*/\1/')
  echo '{"kind":"response","id":"old-request","success":true,"text":"stale"}'
  printf '{"kind":"response","id":"%s","success":true,"text":"fresh"}\n' "$id"
done
"#;
        let pool = WorkerPool::new(settings(1), sh(script)).unwrap();
        pool.start().await.unwrap();
        let resp = pool.submit(AgentRequest::new("default", "hi")).await.unwrap();
        assert_eq!(resp.text, "fresh");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashing_workers_exhaust_budget() {
        let pool = WorkerPool::new(settings(1), sh("read line; exit 1")).unwrap();
        pool.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match pool.submit(AgentRequest::new("default", "hi")).await {
                Err(PoolError::NoWorkers) => break,
                Err(PoolError::ConnectionLost(0)) => {}
                other => panic!("unexpected result: {other:?}"),
            }
            assert!(Instant::now() < deadline, "slot was never removed");
        }

        let status = pool.status().await;
        assert!(status.workers.is_empty());
        assert_eq!(status.live_count, 0);
        pool.shutdown().await;
    }
}
