//! 运行过程事件：供 CLI / Web 流式展示规划、动作、反思与终止

use serde::Serialize;

use crate::core::state::{AgentStatus, OutcomeStatus, TerminationReason};

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged { status: AgentStatus },
    /// 新计划（第几次规划 + 步骤数）
    PlanReady { cycle: usize, steps: usize },
    ActionStarted { step: usize, action: String },
    ActionFinished {
        step: usize,
        action: String,
        status: OutcomeStatus,
        message: String,
    },
    /// 动作参数解析失败（累计次数）
    ParseFailure { step: usize, failures: usize, error: String },
    Reflection { step: usize, success: bool, thought: String },
    FeedbackConsumed { text: String },
    SubtaskStarted { depth: usize, description: String },
    SubtaskFinished { depth: usize, description: String, success: bool },
    Terminated {
        status: AgentStatus,
        reason: Option<TerminationReason>,
    },
}
