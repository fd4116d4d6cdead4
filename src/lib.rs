//! mmagent - 多模态桌面智能体
//!
//! 模块划分：
//! - **agent**: 按配置装配 Planner / Critic / ActionDispatcher / 知识库
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态模型、错误、取消监管、控制面（AgentController）
//! - **llm**: Oracle 网关与后端适配（Gemini / OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: SQLite 知识库与状态存储、用户反馈队列
//! - **observability**: tracing 初始化与内存日志缓冲
//! - **react**: 响应解析、提示词、Planner、Critic、编排主循环
//! - **tools**: 动作白名单、分派器与外部协作者

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{create_agent_components, AgentComponents};
pub use core::{AgentController, AgentError, AgentState, AgentStatus};
