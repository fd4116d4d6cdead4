//! 状态定义：AgentState 及其组成记录
//!
//! AgentState 由编排循环独占写入；外部只通过 watch 通道拿到克隆出来的快照。
//! 持久化时整体序列化为 JSON（截图字节以 base64 存储）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Agent 状态机的阶段
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Planning,
    ExecutingPlan,
    Completed,
    Aborted,
}

impl AgentStatus {
    /// completed / aborted 为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// 是否有运行中的任务（可以接受新任务的只有 idle 与终态）
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Planning | Self::ExecutingPlan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::ExecutingPlan => "executing_plan",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行结束的原因，区分「失控」与「坏任务」
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Cancelled,
    PlanGenerationFailed,
    PlanningBudgetExhausted,
    StepBudgetExhausted,
    SubtaskFailed,
    SubtaskDepthExceeded,
}

/// 计划中的一步：action + 描述 + 其余参数（参数平铺在同一 JSON 对象里）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl PlanStep {
    pub fn new(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// 从 plan 数组中的一项构造；缺少字符串类型的 action 时返回 None
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let action = obj.get("action")?.as_str()?.trim();
        if action.is_empty() {
            return None;
        }
        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parameters = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "action" && k.as_str() != "description")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Self {
            action: action.to_string(),
            description,
            parameters,
        })
    }

    /// 转为可直接交给 dispatcher 的记录（action + 参数）
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = self.parameters.clone();
        record.insert("action".to_string(), Value::String(self.action.clone()));
        record
    }

    /// 稳定签名，用于统计每一步的失败次数
    pub fn signature(&self) -> String {
        let mut record = self.to_record();
        record.insert(
            "description".to_string(),
            Value::String(self.description.clone()),
        );
        // serde_json::Map 默认按键排序
        Value::Object(record).to_string()
    }

    pub fn display_name(&self) -> &str {
        if self.description.is_empty() {
            &self.action
        } else {
            &self.description
        }
    }
}

/// 一次动作执行的结果状态，是下游重试 / 前进判断的唯一依据
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    PendingUserInput,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::PendingUserInput => "pending_user_input",
        }
    }
}

/// dispatcher 的统一返回
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::PendingUserInput,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// 序列化为提示词里使用的 JSON 文本
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

/// 历史审计条目：时间戳 + 执行时的动作记录 + 执行结果状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub action: Map<String, Value>,
    #[serde(default)]
    pub status: Option<OutcomeStatus>,
}

impl ActionRecord {
    pub fn new(action: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            status: None,
        }
    }

    pub fn action_name(&self) -> &str {
        self.action
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}

/// 单次运行的计数器；每次 run 开始时清零，运行中单调不减（重试类计数器在升级时归零）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub planning_cycles: usize,
    pub total_steps: usize,
    pub parse_failures: usize,
    pub action_execution_retries: usize,
}

/// Agent 完整状态（唯一可变记录）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub status: AgentStatus,
    pub current_task: String,
    #[serde(default)]
    pub current_plan: Vec<PlanStep>,
    #[serde(default)]
    pub plan_step: usize,
    #[serde(default)]
    pub history: Vec<ActionRecord>,
    #[serde(default)]
    pub last_action_feedback: Option<Outcome>,
    #[serde(default)]
    pub last_read_content: Option<String>,
    #[serde(default)]
    pub last_directory_list: Option<Vec<String>>,
    #[serde(default)]
    pub last_retrieved_knowledge: Option<String>,
    #[serde(default, with = "screenshot_b64")]
    pub last_screenshot_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub pending_user_question: Option<String>,
    /// 最近一条被消费的用户反馈
    #[serde(default)]
    pub last_feedback: Option<String>,
    #[serde(default)]
    pub counters: RunCounters,
    /// 步骤签名 -> 失败次数
    #[serde(default)]
    pub failed_steps: BTreeMap<String, u32>,
    #[serde(default)]
    pub successful_steps: Vec<String>,
    #[serde(default)]
    pub termination: Option<TerminationReason>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            run_id: None,
            status: AgentStatus::Idle,
            current_task: "None".to_string(),
            current_plan: Vec::new(),
            plan_step: 0,
            history: Vec::new(),
            last_action_feedback: None,
            last_read_content: None,
            last_directory_list: None,
            last_retrieved_knowledge: None,
            last_screenshot_bytes: None,
            pending_user_question: None,
            last_feedback: None,
            counters: RunCounters::default(),
            failed_steps: BTreeMap::new(),
            successful_steps: Vec::new(),
            termination: None,
        }
    }
}

impl AgentState {
    /// 开始新任务：保留历史与观察缓存，重置计划、计数器与终止原因
    pub fn begin_run(&mut self, task: &str) {
        self.run_id = Some(Uuid::new_v4());
        self.current_task = task.to_string();
        self.status = AgentStatus::Planning;
        self.current_plan.clear();
        self.plan_step = 0;
        self.counters = RunCounters::default();
        self.failed_steps.clear();
        self.successful_steps.clear();
        self.pending_user_question = None;
        self.termination = None;
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.current_plan.get(self.plan_step)
    }

    pub fn abort(&mut self, reason: TerminationReason) {
        self.status = AgentStatus::Aborted;
        self.termination = Some(reason);
    }

    /// 最近 n 条历史
    pub fn recent_history(&self, n: usize) -> &[ActionRecord] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}

/// 截取前 max 个字符，超出时追加 "..."（日志、提示词与反馈详情共用）
pub fn preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

mod screenshot_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preview_counts_chars_not_bytes() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 6), "abcdef");
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("截图已保存到文件", 2), "截图...");
        assert_eq!(preview("", 0), "");
    }

    #[test]
    fn test_plan_step_flattens_parameters() {
        let step = PlanStep::from_value(&json!({
            "action": "write_file",
            "file": "a.txt",
            "content": "x",
            "description": "write it"
        }))
        .unwrap();
        assert_eq!(step.action, "write_file");
        assert_eq!(step.description, "write it");
        assert_eq!(step.parameters.len(), 2);

        let record = step.to_record();
        assert_eq!(record["action"], "write_file");
        assert_eq!(record["file"], "a.txt");
        assert!(!record.contains_key("description"));
    }

    #[test]
    fn test_plan_step_requires_action() {
        assert!(PlanStep::from_value(&json!({"description": "no action"})).is_none());
        assert!(PlanStep::from_value(&json!({"action": 3})).is_none());
        assert!(PlanStep::from_value(&json!("read_file")).is_none());
    }

    #[test]
    fn test_state_json_keeps_screenshot() {
        let mut state = AgentState::default();
        state.last_screenshot_bytes = Some(vec![0x89, b'P', b'N', b'G']);
        state.history.push(ActionRecord::new(
            PlanStep::new("wait", "").to_record(),
        ));
        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("\"status\":\"idle\""));
        let back: AgentState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_begin_run_resets_counters() {
        let mut state = AgentState::default();
        state.counters.planning_cycles = 3;
        state.plan_step = 2;
        state.termination = Some(TerminationReason::Cancelled);
        state.begin_run("do it");
        assert_eq!(state.status, AgentStatus::Planning);
        assert_eq!(state.counters, RunCounters::default());
        assert_eq!(state.plan_step, 0);
        assert!(state.termination.is_none());
        assert!(state.run_id.is_some());
    }
}
