//! Agent 组件装配
//!
//! create_agent_components 按 AppConfig 构建 Planner / Critic / ActionDispatcher / 知识库 与预算，
//! 供 CLI（src/main.rs）与 HTTP 前端（src/bin/web.rs）共用；AgentController 在其上管理单个运行。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, Budgets};
use crate::llm::{create_llm_from_config, OracleGateway};
use crate::memory::{InMemoryKnowledgeStore, KnowledgeStore, SqliteKnowledgeStore};
use crate::react::{Critic, Planner};
use crate::tools::{
    ActionDispatcher, GoogleCseSearch, LocalFileStore, MediaLocator, SystemShell,
};

/// 预构建的 Agent 组件
pub struct AgentComponents {
    pub planner: Planner,
    pub critic: Critic,
    pub dispatcher: ActionDispatcher,
    pub store: Arc<dyn KnowledgeStore>,
    pub budgets: Budgets,
    /// 每步观察截图写入的位置
    pub screenshot_path: Option<PathBuf>,
    /// cancel 等待运行自行停止的时长，超时后强制标记 aborted
    pub cancel_grace: Duration,
    pub feedback_capacity: usize,
}

impl AgentComponents {
    /// 用同一个网关构建 Planner 与 Critic，其余取默认值（测试与嵌入使用）
    pub fn new(
        gateway: OracleGateway,
        dispatcher: ActionDispatcher,
        store: Arc<dyn KnowledgeStore>,
        budgets: Budgets,
    ) -> Self {
        Self {
            planner: Planner::new(gateway.clone(), budgets.history_window),
            critic: Critic::new(gateway),
            dispatcher,
            store,
            budgets,
            screenshot_path: None,
            cancel_grace: Duration::from_secs(2),
            feedback_capacity: 64,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_screenshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.screenshot_path = Some(path.into());
        self
    }
}

/// 工作目录：配置 > 当前目录下的 workspace；不存在时创建
pub fn resolve_workspace(cfg: &AppConfig) -> anyhow::Result<PathBuf> {
    let workspace = match cfg.app.workspace_root.clone() {
        Some(p) => p,
        None => std::env::current_dir()
            .context("Cannot determine current directory")?
            .join("workspace"),
    };
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Cannot create workspace {}", workspace.display()))?;
    Ok(workspace.canonicalize().unwrap_or(workspace))
}

fn open_store(path: &Path) -> Arc<dyn KnowledgeStore> {
    match SqliteKnowledgeStore::open(path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Knowledge base unavailable, state will not survive restarts");
            Arc::new(InMemoryKnowledgeStore::new())
        }
    }
}

/// 按配置创建全部组件
pub fn create_agent_components(cfg: &AppConfig) -> anyhow::Result<AgentComponents> {
    let workspace = resolve_workspace(cfg)?;
    tracing::info!(workspace = %workspace.display(), "Workspace ready");

    let gateway = create_llm_from_config(&cfg.llm);
    let dispatcher = ActionDispatcher::new(
        Arc::new(LocalFileStore::new(&workspace)),
        Arc::new(SystemShell::new(cfg.tools.shell_timeout_secs).with_working_dir(&workspace)),
    )
    .with_search(Arc::new(GoogleCseSearch::from_config(&cfg.tools.search)))
    .with_media(MediaLocator::from_home());
    #[cfg(feature = "desktop")]
    let dispatcher = {
        let desktop = Arc::new(crate::tools::NativeDesktop::new());
        tracing::info!("Native desktop enabled (screen capture, input, windows)");
        dispatcher
            .with_screen(desktop.clone())
            .with_input(desktop.clone())
            .with_windows(desktop)
    };

    let budgets = cfg.agent.budgets();
    let mut components = AgentComponents::new(gateway, dispatcher, open_store(&cfg.app.state_db), budgets)
        .with_cancel_grace(Duration::from_millis(cfg.agent.cancel_grace_ms))
        .with_screenshot_path(cfg.app.screenshot_path.clone());
    components.feedback_capacity = cfg.agent.feedback_capacity;
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.workspace_root = Some(dir.path().join("ws"));
        cfg.app.state_db = dir.path().join("db/kb.db");
        cfg.llm.provider = "mock".to_string();
        cfg.agent.max_planning_cycles = 7;

        let components = create_agent_components(&cfg).unwrap();
        assert!(dir.path().join("ws").is_dir());
        assert!(dir.path().join("db/kb.db").exists());
        assert_eq!(components.budgets.max_planning_cycles, 7);
        assert!(components.planner.gateway().is_configured());
    }
}
