//! 认知层：响应解析、提示词、Planner、Critic 与编排主循环

pub mod critic;
pub mod events;
pub mod interpreter;
pub mod loop_;
pub mod planner;
pub mod prompts;

pub use critic::Critic;
pub use events::AgentEvent;
pub use interpreter::{interpret, parse_record, Interpretation, Verdict};
pub use loop_::RunSession;
pub use planner::Planner;
pub use prompts::{classify_prompt, PromptKind};
