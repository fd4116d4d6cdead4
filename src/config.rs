//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MMAGENT__*` 覆盖（双下划线表示嵌套，如 `MMAGENT__LLM__PROVIDER=openai`）。
//! API Key 不进配置文件，只从环境变量读取。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub web: WebSection,
}

/// [app] 段：工作目录、状态库、截图路径、日志缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 文件读写的根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// SQLite 知识库 / 状态库路径
    pub state_db: PathBuf,
    /// 每步观察时截图写入的位置
    pub screenshot_path: PathBuf,
    /// /logs 保留的日志行数
    pub log_buffer_lines: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            state_db: PathBuf::from("data/agent_knowledge.db"),
            screenshot_path: PathBuf::from("logs/screens/current_screen_step.png"),
            log_buffer_lines: 500,
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// gemini / openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: crate::llm::gemini::GEMINI_DEFAULT_MODEL.to_string(),
            base_url: None,
            temperature: 0.7,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [agent] 段：预算与节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_total_steps: usize,
    pub max_planning_cycles: usize,
    pub max_parse_retries: usize,
    pub max_action_execution_retries: usize,
    /// 两轮之间的停顿（毫秒）
    pub step_delay_ms: u64,
    pub max_subtask_depth: usize,
    /// cancel 后等待 worker 自行退出的时间，超时强制标记 aborted
    pub cancel_grace_ms: u64,
    pub feedback_capacity: usize,
    /// 提示词里带入的最近历史条数
    pub history_window: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_total_steps: 50,
            max_planning_cycles: 3,
            max_parse_retries: 3,
            max_action_execution_retries: 2,
            step_delay_ms: 1000,
            max_subtask_depth: 5,
            cancel_grace_ms: 2000,
            feedback_capacity: 64,
            history_window: 5,
        }
    }
}

/// 单次 run 的预算常量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub max_total_steps: usize,
    pub max_planning_cycles: usize,
    pub max_parse_retries: usize,
    pub max_action_execution_retries: usize,
    pub max_subtask_depth: usize,
    pub history_window: usize,
    pub step_delay: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        AgentSection::default().budgets()
    }
}

impl AgentSection {
    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_total_steps: self.max_total_steps,
            max_planning_cycles: self.max_planning_cycles,
            max_parse_retries: self.max_parse_retries,
            max_action_execution_retries: self.max_action_execution_retries,
            max_subtask_depth: self.max_subtask_depth,
            history_window: self.history_window,
            step_delay: Duration::from_millis(self.step_delay_ms),
        }
    }
}

/// [web] 段：HTTP 控制面
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

/// [tools] 段：Shell 超时与搜索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub shell_timeout_secs: u64,
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 120,
            search: SearchSection::default(),
        }
    }
}

/// [tools.search] 段：Google Custom Search 凭据所在的环境变量名与结果限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub api_key_env: String,
    pub engine_id_env: String,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_result_chars: 1000,
            api_key_env: "GOOGLE_CSE_API_KEY".to_string(),
            engine_id_env: "GOOGLE_CSE_ID".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MMAGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MMAGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MMAGENT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
