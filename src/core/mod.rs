//! 核心层：状态模型、错误类型、取消监管与控制面

pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use error::AgentError;
pub use orchestrator::AgentController;
pub use session_supervisor::SessionSupervisor;
pub use state::{
    preview, ActionRecord, AgentState, AgentStatus, Outcome, OutcomeStatus, PlanStep,
    RunCounters, TerminationReason,
};
