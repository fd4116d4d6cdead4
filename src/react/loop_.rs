//! 编排主循环
//!
//! planning -> executing_plan -> (dispatch + reflection) -> ... 直到 completed / aborted。
//! - 每个阶段边界都检查取消令牌，取消优先于任何重试逻辑
//! - 预算：规划次数、总步数（规划次数累计）、解析重试、动作重试、子任务深度
//! - 每次执行动作后与终态时保存状态，并通过 watch 通道发布快照
//! - 可选 event_tx：向 CLI / Web 推送 AgentEvent

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Budgets;
use crate::core::state::{AgentState, AgentStatus, Outcome, PlanStep, TerminationReason};
use crate::core::AgentError;
use crate::memory::{FeedbackReceiver, KnowledgeStore};
use crate::react::interpreter::{is_unknown, unknown_reason};
use crate::react::{AgentEvent, Critic, Planner};
use crate::tools::ActionDispatcher;

/// 递归分解子任务的伪动作（不在分派白名单内，由循环自己处理）
pub const DECOMPOSE_SUBTASK: &str = "decompose_subtask";
/// 自评结果在知识库中的键前缀
pub const SELF_EVALUATION_PREFIX: &str = "self_evaluation_";

/// 自评在知识库中的键：毫秒时间戳 + run_id，同一秒内的多次完成互不覆盖
fn self_evaluation_key(state: &AgentState) -> String {
    let millis = Utc::now().timestamp_millis();
    match state.run_id {
        Some(id) => format!("{}{}_{}", SELF_EVALUATION_PREFIX, millis, id.simple()),
        None => format!("{}{}", SELF_EVALUATION_PREFIX, millis),
    }
}

type SubplanFuture<'s> = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 's>>;

fn is_decompose(step: &PlanStep) -> bool {
    step.action.trim().eq_ignore_ascii_case(DECOMPOSE_SUBTASK)
}

/// 子任务描述：优先 subtask_description 参数，其次步骤描述
fn subtask_description(step: &PlanStep) -> String {
    step.parameters
        .get("subtask_description")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| step.description.clone())
}

fn send_event(tx: &Option<&mpsc::UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 一次运行所需的全部协作者与预算
pub struct RunSession<'a> {
    pub planner: &'a Planner,
    pub critic: &'a Critic,
    pub dispatcher: &'a ActionDispatcher,
    pub budgets: Budgets,
    pub cancel_token: CancellationToken,
    /// 可选：状态持久化与自评存储
    pub store: Option<&'a dyn KnowledgeStore>,
    /// 可选：用户反馈队列
    pub feedback: Option<&'a FeedbackReceiver>,
    /// 可选：状态快照发布
    pub snapshot_tx: Option<&'a watch::Sender<AgentState>>,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a mpsc::UnboundedSender<AgentEvent>>,
    /// 可选：每步观察截图写入的位置
    pub screenshot_path: Option<&'a Path>,
}

impl<'a> RunSession<'a> {
    pub fn new(
        planner: &'a Planner,
        critic: &'a Critic,
        dispatcher: &'a ActionDispatcher,
        budgets: Budgets,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            critic,
            dispatcher,
            budgets,
            cancel_token,
            store: None,
            feedback: None,
            snapshot_tx: None,
            event_tx: None,
            screenshot_path: None,
        }
    }

    pub fn with_store(mut self, store: &'a dyn KnowledgeStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_feedback(mut self, feedback: &'a FeedbackReceiver) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_snapshots(mut self, tx: &'a watch::Sender<AgentState>) -> Self {
        self.snapshot_tx = Some(tx);
        self
    }

    pub fn with_event_tx(mut self, tx: &'a mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_screenshot_path(mut self, path: &'a Path) -> Self {
        self.screenshot_path = Some(path);
        self
    }

    /// 运行一个任务直到终态，返回最终状态
    pub async fn run(&self, state: &mut AgentState, task: &str) -> AgentStatus {
        state.begin_run(task);
        tracing::info!(task = %task, run_id = ?state.run_id, "Starting new task");
        self.status_changed(state);

        loop {
            if self.cancel_token.is_cancelled() {
                self.abort(state, TerminationReason::Cancelled, "Task cancelled by user.");
                break;
            }
            if state.counters.total_steps >= self.budgets.max_total_steps {
                tracing::warn!(total_steps = state.counters.total_steps, "Max total steps reached");
                self.abort(
                    state,
                    TerminationReason::StepBudgetExhausted,
                    format!(
                        "Step budget exhausted after {} steps without completing the task.",
                        state.counters.total_steps
                    ),
                );
                break;
            }

            match state.status {
                AgentStatus::Planning => self.planning_phase(state).await,
                AgentStatus::ExecutingPlan => self.execution_phase(state).await,
                AgentStatus::Completed | AgentStatus::Idle | AgentStatus::Aborted => {}
            }

            match state.status {
                AgentStatus::Completed => {
                    self.complete(state).await;
                    break;
                }
                AgentStatus::Aborted | AgentStatus::Idle => break,
                AgentStatus::Planning | AgentStatus::ExecutingPlan => self.pause().await,
            }
        }

        self.finish(state)
    }

    /// 迭代间隔；取消时提前醒来，由下一轮顶部的检查转 aborted
    async fn pause(&self) {
        if self.budgets.step_delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.budgets.step_delay) => {}
            _ = self.cancel_token.cancelled() => {}
        }
    }

    fn cancelled(&self, state: &mut AgentState) -> bool {
        if self.cancel_token.is_cancelled() {
            self.abort(state, TerminationReason::Cancelled, "Task cancelled by user.");
            true
        } else {
            false
        }
    }

    fn ensure_active(&self) -> Result<(), AgentError> {
        if self.cancel_token.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn planning_phase(&self, state: &mut AgentState) {
        if state.counters.planning_cycles >= self.budgets.max_planning_cycles {
            tracing::warn!(cycles = state.counters.planning_cycles, "Max planning cycles reached");
            self.abort(
                state,
                TerminationReason::PlanningBudgetExhausted,
                format!(
                    "Planning budget exhausted after {} planning cycles.",
                    state.counters.planning_cycles
                ),
            );
            return;
        }
        state.counters.planning_cycles += 1;
        state.counters.total_steps += 1;
        state.counters.action_execution_retries = 0;
        state.plan_step = 0;
        tracing::info!(
            cycle = state.counters.planning_cycles,
            max = self.budgets.max_planning_cycles,
            "Planning"
        );

        let task = state.current_task.clone();
        let result = self.planner.plan(&task, state).await;
        if self.cancelled(state) {
            return;
        }
        match result {
            Ok(plan) => {
                send_event(
                    &self.event_tx,
                    AgentEvent::PlanReady {
                        cycle: state.counters.planning_cycles,
                        steps: plan.len(),
                    },
                );
                state.current_plan = plan;
                state.status = AgentStatus::ExecutingPlan;
                self.status_changed(state);
                self.checkpoint(state);
            }
            Err(e) => {
                self.abort(state, TerminationReason::PlanGenerationFailed, e.to_string());
            }
        }
    }

    async fn execution_phase(&self, state: &mut AgentState) {
        let Some(step) = state.current_step().cloned() else {
            tracing::info!("All plan steps consumed, re-planning");
            state.status = AgentStatus::Planning;
            self.status_changed(state);
            return;
        };
        let index = state.plan_step;

        if is_decompose(&step) {
            self.decompose_step(state, &step).await;
            return;
        }

        let image = self.observe(state);
        if self.cancelled(state) {
            return;
        }
        if let Some(feedback) = self.feedback {
            for text in feedback.absorb_into(state) {
                send_event(&self.event_tx, AgentEvent::FeedbackConsumed { text });
            }
        }

        tracing::info!(
            step = index + 1,
            total = state.current_plan.len(),
            action = %step.action,
            description = %step.description,
            "Executing plan step"
        );
        send_event(
            &self.event_tx,
            AgentEvent::ActionStarted {
                step: index,
                action: step.action.clone(),
            },
        );
        let record = self.planner.next_action(state, &step, image.as_deref()).await;
        if self.cancelled(state) {
            return;
        }

        if is_unknown(&record) {
            let reason = unknown_reason(&record);
            state.counters.parse_failures += 1;
            tracing::warn!(
                step = index + 1,
                failures = state.counters.parse_failures,
                error = %reason,
                "Could not parse action parameters"
            );
            send_event(
                &self.event_tx,
                AgentEvent::ParseFailure {
                    step: index,
                    failures: state.counters.parse_failures,
                    error: reason.clone(),
                },
            );
            if state.counters.parse_failures >= self.budgets.max_parse_retries {
                tracing::warn!("Max parse retries reached, forcing re-planning");
                state.counters.parse_failures = 0;
                state.counters.action_execution_retries = 0;
                state.status = AgentStatus::Planning;
                self.status_changed(state);
            } else {
                state.last_action_feedback = Some(Outcome::failure(format!(
                    "LLM response parsing failed. Expected ONLY a single JSON object for action parameters. Error: {}. Please output a valid JSON object matching the action schema for: {}.",
                    reason, step.action
                )));
            }
            return;
        }
        state.counters.parse_failures = 0;

        let outcome = self.dispatcher.dispatch(&record, state, &self.cancel_token).await;
        let executed = record
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(&step.action)
            .to_string();
        tracing::info!(
            action = %executed,
            status = outcome.status.as_str(),
            message = %outcome.message,
            "Action finished"
        );
        send_event(
            &self.event_tx,
            AgentEvent::ActionFinished {
                step: index,
                action: executed.clone(),
                status: outcome.status,
                message: outcome.message.clone(),
            },
        );
        self.checkpoint(state);
        if self.cancelled(state) {
            return;
        }

        let verdict = self
            .critic
            .reflect(state, &step, &record, &outcome, image.as_deref())
            .await;
        if self.cancelled(state) {
            return;
        }
        send_event(
            &self.event_tx,
            AgentEvent::Reflection {
                step: index,
                success: verdict.is_success(),
                thought: verdict.thought.clone(),
            },
        );

        if verdict.is_success() {
            state.plan_step += 1;
            state.counters.action_execution_retries = 0;
            state.successful_steps.push(step.display_name().to_string());
            state.last_action_feedback = Some(outcome);
        } else {
            state.counters.action_execution_retries += 1;
            *state.failed_steps.entry(step.signature()).or_insert(0) += 1;
            let reason = verdict
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "No specific reason.".to_string());
            if state.counters.action_execution_retries >= self.budgets.max_action_execution_retries {
                tracing::warn!(
                    action = %executed,
                    retries = state.counters.action_execution_retries,
                    "Step repeatedly failed, forcing re-planning"
                );
                state.counters.action_execution_retries = 0;
                let description = if step.description.is_empty() {
                    "N/A"
                } else {
                    step.description.as_str()
                };
                state.last_action_feedback = Some(Outcome::failure(format!(
                    "Action '{}' for plan step '{}' repeatedly failed or could not be confirmed. LLM said: {}. Please adjust the plan.",
                    executed, description, reason
                )));
                // task_complete 已经生效时不回退
                if state.status != AgentStatus::Completed {
                    state.status = AgentStatus::Planning;
                    self.status_changed(state);
                }
            } else {
                tracing::info!(
                    action = %executed,
                    retries = state.counters.action_execution_retries,
                    "Reflection reported failure, retrying step"
                );
                state.last_action_feedback = Some(
                    Outcome::failure(format!(
                        "Previous action '{}' failed (LLM reflection). Retrying step. LLM reason: {}",
                        executed, reason
                    ))
                    .with_details(outcome.details),
                );
            }
        }
        self.checkpoint(state);
    }

    /// 截取当前屏幕作为本步观察，截图失败时本步不带图片
    fn observe(&self, state: &mut AgentState) -> Option<Vec<u8>> {
        let bytes = self.dispatcher.screen().capture(self.screenshot_path)?;
        state.last_screenshot_bytes = Some(bytes.clone());
        Some(bytes)
    }

    async fn decompose_step(&self, state: &mut AgentState, step: &PlanStep) {
        let description = subtask_description(step);
        match self.run_subplan(state, description.clone(), 1).await {
            Ok(()) => {
                tracing::info!(subtask = %description, "Subtask completed");
                state.plan_step += 1;
                state.counters.action_execution_retries = 0;
                state.successful_steps.push(step.display_name().to_string());
                state.last_action_feedback =
                    Some(Outcome::success(format!("Subtask '{}' completed.", description)));
                self.checkpoint(state);
            }
            Err(AgentError::Cancelled) => {
                self.abort(state, TerminationReason::Cancelled, "Task cancelled by user.");
            }
            Err(e @ AgentError::SubtaskDepthExceeded(_)) => {
                self.abort(state, TerminationReason::SubtaskDepthExceeded, e.to_string());
            }
            Err(e) => {
                self.abort(state, TerminationReason::SubtaskFailed, e.to_string());
            }
        }
    }

    /// 子计划：只生成一次计划，逐步直接执行；任何一步不成功即整体失败
    fn run_subplan<'s>(
        &'s self,
        state: &'s mut AgentState,
        description: String,
        depth: usize,
    ) -> SubplanFuture<'s> {
        Box::pin(async move {
            if depth > self.budgets.max_subtask_depth {
                tracing::error!(depth, subtask = %description, "Subtask depth limit exceeded");
                return Err(AgentError::SubtaskDepthExceeded(self.budgets.max_subtask_depth));
            }
            self.ensure_active()?;
            tracing::info!(depth, subtask = %description, "Decomposing subtask");
            send_event(
                &self.event_tx,
                AgentEvent::SubtaskStarted {
                    depth,
                    description: description.clone(),
                },
            );

            let result: Result<(), AgentError> = async {
                let plan = self.planner.plan(&description, state).await.map_err(|e| {
                    AgentError::SubtaskFailed(format!("could not plan '{}': {}", description, e))
                })?;
                for step in plan {
                    self.ensure_active()?;
                    if is_decompose(&step) {
                        self.run_subplan(state, subtask_description(&step), depth + 1)
                            .await?;
                        continue;
                    }
                    let outcome = self
                        .dispatcher
                        .dispatch(&step.to_record(), state, &self.cancel_token)
                        .await;
                    self.checkpoint(state);
                    self.ensure_active()?;
                    if !outcome.is_success() {
                        return Err(AgentError::SubtaskFailed(format!(
                            "step '{}' of '{}' failed: {}",
                            step.display_name(),
                            description,
                            outcome.message
                        )));
                    }
                    state.last_action_feedback = Some(outcome);
                }
                Ok(())
            }
            .await;

            send_event(
                &self.event_tx,
                AgentEvent::SubtaskFinished {
                    depth,
                    description: description.clone(),
                    success: result.is_ok(),
                },
            );
            result
        })
    }

    /// 完成后的一次自评，结果按时间戳写入知识库；失败只记日志
    async fn complete(&self, state: &mut AgentState) {
        state.termination = Some(TerminationReason::Completed);
        tracing::info!(task = %state.current_task, "Task completed");
        let evaluation = self.critic.self_evaluate(state).await;
        let key = self_evaluation_key(state);
        match self.store {
            Some(store) if store.put(&key, &evaluation.to_string()) => {
                tracing::info!(key = %key, "Self-evaluation stored");
            }
            Some(_) => tracing::warn!(key = %key, "Failed to store self-evaluation"),
            None => tracing::debug!("No knowledge store, self-evaluation not persisted"),
        }
    }

    fn abort(&self, state: &mut AgentState, reason: TerminationReason, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(reason = ?reason, message = %message, "Run aborted");
        state.abort(reason);
        state.last_action_feedback = Some(Outcome::failure(message));
        self.status_changed(state);
    }

    fn status_changed(&self, state: &AgentState) {
        send_event(
            &self.event_tx,
            AgentEvent::StatusChanged {
                status: state.status,
            },
        );
        self.publish(state);
    }

    fn publish(&self, state: &AgentState) {
        if let Some(tx) = self.snapshot_tx {
            tx.send_replace(state.clone());
        }
    }

    fn checkpoint(&self, state: &AgentState) {
        self.publish(state);
        if let Some(store) = self.store {
            if !store.save_state(state) {
                tracing::warn!("Failed to persist agent state");
            }
        }
    }

    fn finish(&self, state: &mut AgentState) -> AgentStatus {
        self.checkpoint(state);
        tracing::info!(
            status = %state.status,
            reason = ?state.termination,
            planning_cycles = state.counters.planning_cycles,
            actions = state.history.len(),
            "Run finished"
        );
        send_event(
            &self.event_tx,
            AgentEvent::Terminated {
                status: state.status,
                reason: state.termination.clone(),
            },
        );
        state.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_evaluation_keys_differ_between_runs() {
        let mut first = AgentState::default();
        first.begin_run("a");
        let mut second = AgentState::default();
        second.begin_run("a");
        let a = self_evaluation_key(&first);
        let b = self_evaluation_key(&second);
        assert!(a.starts_with(SELF_EVALUATION_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subtask_description_prefers_parameter() {
        let step = PlanStep::new(DECOMPOSE_SUBTASK, "draw things")
            .with_param("subtask_description", "Draw a circle in Paint");
        assert_eq!(subtask_description(&step), "Draw a circle in Paint");
        assert_eq!(
            subtask_description(&PlanStep::new("decompose_subtask", "draw things")),
            "draw things"
        );
        assert!(is_decompose(&PlanStep::new(" Decompose_Subtask ", "")));
        assert!(!is_decompose(&PlanStep::new("wait", "")));
    }
}
