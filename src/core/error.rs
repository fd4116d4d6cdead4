//! Agent 错误类型
//!
//! 解析错误与动作失败在循环内部就地恢复（转为 Outcome / 重试计数），
//! 这里只列出会跨越模块边界的错误：任务冲突、计划生成失败、子任务失败、持久化等。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 已有任务在运行，新任务被拒绝（不排队）
    #[error("Agent is busy with another task")]
    Busy,

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    #[error("Subtask failed: {0}")]
    SubtaskFailed(String),

    #[error("Subtask depth limit {0} exceeded")]
    SubtaskDepthExceeded(usize),

    /// 反馈队列已满或已关闭
    #[error("Feedback rejected: {0}")]
    FeedbackRejected(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}
