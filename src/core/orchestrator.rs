//! 控制面：AgentController
//!
//! 同一时刻只允许一个运行：submit 在已有运行时返回 Busy，不排队。
//! 运行在后台 tokio 任务中独占 AgentState；外部读取只拿 watch 通道里的快照。
//! “有运行”由 running 通道表示，只在 worker 任务真正退出（含被中止）时清除。
//! cancel 先置位取消令牌并等待 grace 时长，超时后中止任务并强制标记 aborted。

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::agent::AgentComponents;
use crate::core::state::{AgentState, AgentStatus, Outcome, TerminationReason};
use crate::core::{AgentError, SessionSupervisor};
use crate::memory::{feedback_channel, FeedbackReceiver, FeedbackSender};
use crate::observability::LogBuffer;
use crate::react::{AgentEvent, RunSession};

/// 当前（或最近一次）运行的 worker
struct Worker {
    seq: u64,
    abort: AbortHandle,
}

/// worker 退出时（正常结束、panic 或被中止）清除 running
struct RunningGuard(Arc<watch::Sender<bool>>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Run worker panicked");
        }
        self.0.send_replace(false);
    }
}

/// 单 Agent 控制器
pub struct AgentController {
    components: Arc<AgentComponents>,
    state: Arc<tokio::sync::Mutex<AgentState>>,
    snapshot_tx: Arc<watch::Sender<AgentState>>,
    supervisor: SessionSupervisor,
    feedback_tx: FeedbackSender,
    feedback_rx: Arc<FeedbackReceiver>,
    worker: Mutex<Option<Worker>>,
    running: Arc<watch::Sender<bool>>,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
    logs: Option<LogBuffer>,
}

impl AgentController {
    /// 从知识库恢复上次状态（没有则为 idle）；恢复出的未结束状态视为已中断
    pub fn new(components: AgentComponents) -> Self {
        let mut initial = components.store.load_state().unwrap_or_default();
        if initial.status.is_busy() {
            tracing::warn!(task = %initial.current_task, "Previous run was interrupted, marking it aborted");
            initial.abort(TerminationReason::Cancelled);
        }
        let (feedback_tx, feedback_rx) = feedback_channel(components.feedback_capacity);
        let (snapshot_tx, _) = watch::channel(initial.clone());
        Self {
            components: Arc::new(components),
            state: Arc::new(tokio::sync::Mutex::new(initial)),
            snapshot_tx: Arc::new(snapshot_tx),
            supervisor: SessionSupervisor::new(),
            feedback_tx,
            feedback_rx: Arc::new(feedback_rx),
            worker: Mutex::new(None),
            running: Arc::new(watch::channel(false).0),
            event_tx: None,
            logs: None,
        }
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_log_buffer(mut self, logs: LogBuffer) -> Self {
        self.logs = Some(logs);
        self
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        match self.worker.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 是否有运行中的任务
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// 提交任务；已有运行时返回 Busy
    pub fn submit(&self, task: impl Into<String>) -> Result<(), AgentError> {
        let task = task.into();
        let mut slot = self.worker_slot();
        if self.is_running() {
            tracing::warn!(task = %task, "Rejected task, agent is busy");
            return Err(AgentError::Busy);
        }
        let seq = slot.as_ref().map_or(1, |w| w.seq + 1);
        self.running.send_replace(true);
        let guard = RunningGuard(self.running.clone());

        let token = self.supervisor.renew();
        let components = self.components.clone();
        let state = self.state.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let feedback_rx = self.feedback_rx.clone();
        let event_tx = self.event_tx.clone();
        tracing::info!(task = %task, "Task accepted");

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let mut state = state.lock().await;
            let mut session = RunSession::new(
                &components.planner,
                &components.critic,
                &components.dispatcher,
                components.budgets,
                token,
            )
            .with_store(components.store.as_ref())
            .with_feedback(&feedback_rx)
            .with_snapshots(&snapshot_tx);
            if let Some(ref tx) = event_tx {
                session = session.with_event_tx(tx);
            }
            if let Some(ref path) = components.screenshot_path {
                session = session.with_screenshot_path(path);
            }
            session.run(&mut state, &task).await;
        });
        *slot = Some(Worker {
            seq,
            abort: handle.abort_handle(),
        });
        Ok(())
    }

    /// 当前状态快照
    pub fn status(&self) -> AgentState {
        self.snapshot_tx.borrow().clone()
    }

    /// 订阅状态快照
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.snapshot_tx.subscribe()
    }

    /// 用户反馈入队（也用于回答 ask_user）
    pub fn feedback(&self, text: impl Into<String>) -> Result<(), AgentError> {
        let text = text.into();
        tracing::info!(feedback = %text, "Feedback queued");
        self.feedback_tx.try_send(text)
    }

    /// 停止当前运行；在 grace 时长内自行停止返回 true，否则强制标记 aborted 并返回 false
    pub async fn cancel(&self) -> bool {
        self.supervisor.cancel();
        let seq = {
            let slot = self.worker_slot();
            match slot.as_ref() {
                Some(w) if self.is_running() => w.seq,
                _ => return true,
            }
        };
        let grace = self.components.cancel_grace;
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            tracing::info!("Run stopped after cancel");
            return true;
        }

        tracing::warn!(grace_ms = grace.as_millis() as u64, "Run did not stop in time, forcing abort");
        {
            let slot = self.worker_slot();
            if let Some(w) = slot.as_ref().filter(|w| w.seq == seq) {
                w.abort.abort();
            }
        }
        let _ = tokio::time::timeout(grace, self.wait_idle()).await;

        // 持有 slot 锁写入，避免覆盖紧接着提交的新运行
        let slot = self.worker_slot();
        if slot.as_ref().map(|w| w.seq) != Some(seq) || self.is_running() {
            return false;
        }
        let mut snapshot = self.status();
        snapshot.abort(TerminationReason::Cancelled);
        snapshot.last_action_feedback = Some(Outcome::failure(
            "Run force-stopped after the cancel grace period.",
        ));
        if let Ok(mut state) = self.state.try_lock() {
            *state = snapshot.clone();
        }
        if !self.components.store.save_state(&snapshot) {
            tracing::warn!("Failed to persist force-aborted state");
        }
        self.snapshot_tx.send_replace(snapshot);
        false
    }

    /// 等待当前运行结束，返回最终状态
    pub async fn wait(&self) -> AgentStatus {
        self.wait_idle().await;
        self.status().status
    }

    /// 清空内存状态回到 idle（不隐含 cancel）；运行中返回 Busy
    pub async fn reset(&self) -> Result<(), AgentError> {
        if self.is_running() {
            return Err(AgentError::Busy);
        }
        let fresh = AgentState::default();
        *self.state.lock().await = fresh.clone();
        self.feedback_rx.drain();
        if !self.components.store.save_state(&fresh) {
            tracing::warn!("Failed to persist reset state");
        }
        self.snapshot_tx.send_replace(fresh);
        tracing::info!("Agent state reset");
        Ok(())
    }

    /// 最近 n 行日志
    pub fn logs(&self, n: usize) -> Vec<String> {
        self.logs.as_ref().map(|l| l.tail(n)).unwrap_or_default()
    }

    pub fn clear_logs(&self) {
        if let Some(ref l) = self.logs {
            l.clear();
        }
    }

    /// 最近一次观察到的截图
    pub fn screenshot(&self) -> Option<Vec<u8>> {
        self.snapshot_tx.borrow().last_screenshot_bytes.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Budgets;
    use crate::llm::OracleGateway;
    use crate::memory::{InMemoryKnowledgeStore, KnowledgeStore};
    use crate::tools::{ActionDispatcher, LocalFileStore, SystemShell};

    fn components(store: Arc<InMemoryKnowledgeStore>) -> AgentComponents {
        let dir = std::env::temp_dir();
        AgentComponents::new(
            OracleGateway::unconfigured(),
            ActionDispatcher::new(Arc::new(LocalFileStore::new(&dir)), Arc::new(SystemShell::new(5))),
            store,
            Budgets::default(),
        )
    }

    #[tokio::test]
    async fn test_status_is_stable_when_idle() {
        let controller = AgentController::new(components(Arc::new(InMemoryKnowledgeStore::new())));
        let first = controller.status();
        assert_eq!(first.status, AgentStatus::Idle);
        assert_eq!(controller.status(), first);
        assert_eq!(controller.status(), first);
        assert!(controller.screenshot().is_none());
        assert!(controller.logs(10).is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_state_is_not_left_busy() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let mut saved = AgentState::default();
        saved.begin_run("half done");
        saved.status = AgentStatus::ExecutingPlan;
        store.save_state(&saved);

        let controller = AgentController::new(components(store));
        let status = controller.status();
        assert_eq!(status.status, AgentStatus::Aborted);
        assert_eq!(status.current_task, "half done");
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let mut saved = AgentState::default();
        saved.current_task = "old".to_string();
        saved.status = AgentStatus::Completed;
        store.save_state(&saved);

        let controller = AgentController::new(components(store.clone()));
        assert_eq!(controller.status().current_task, "old");
        controller.reset().await.unwrap();
        assert_eq!(controller.status(), AgentState::default());
        assert_eq!(store.load_state(), Some(AgentState::default()));
    }
}
