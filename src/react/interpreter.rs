//! 响应解析：从 LLM 自由文本中取出唯一的结构化记录
//!
//! 取第一个 `{` 到最后一个 `}` 之间的子串做 JSON 解析，再按键分类：
//! plan → 计划，status → 反思结论，action → 动作记录；只有 command 没有 action 时推断为 execute_shell_command。
//! 任何失败（无花括号、解码错误、缺少必需键）都返回 `{"action": "unknown", "error": ...}`，从不报错。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::state::PlanStep;

pub const UNKNOWN_ACTION: &str = "unknown";
const SHELL_ACTION: &str = "execute_shell_command";

/// 反思结论
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verdict {
    pub status: String,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("success")
    }

    fn from_record(record: &Map<String, Value>) -> Self {
        let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            status: text("status").unwrap_or_else(|| "failure".to_string()),
            thought: text("thought").unwrap_or_default(),
            message: text("message").or_else(|| text("error")),
        }
    }
}

/// 解析结果分类
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Plan(Vec<PlanStep>),
    /// 有 plan 键但内容不可用
    InvalidPlan(String),
    Verdict(Verdict),
    Action(Map<String, Value>),
    Unknown(String),
}

fn unknown(error: impl Into<String>) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("action".to_string(), Value::String(UNKNOWN_ACTION.to_string()));
    record.insert("error".to_string(), Value::String(error.into()));
    record
}

/// 是否为解析失败的哨兵记录
pub fn is_unknown(record: &Map<String, Value>) -> bool {
    record.get("action").and_then(Value::as_str) == Some(UNKNOWN_ACTION)
}

/// 哨兵记录里的错误原因
pub fn unknown_reason(record: &Map<String, Value>) -> String {
    record
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// 解析为原始记录；失败时返回 unknown 哨兵
pub fn parse_record(text: &str) -> Map<String, Value> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        tracing::warn!("LLM response not in JSON format");
        return unknown("LLM response not in JSON format");
    };
    if end < start {
        return unknown("LLM response not in JSON format");
    }
    let mut record = match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return unknown("Parsed JSON missing required key ('action', 'plan', or 'status')"),
        Err(e) => {
            tracing::warn!(error = %e, "JSON decode error in LLM response");
            return unknown(format!("JSON decode error: {}", e));
        }
    };
    let has_key = |k: &str| record.contains_key(k);
    if !has_key("action") && !has_key("plan") && !has_key("status") {
        if has_key("command") {
            tracing::debug!("Inferred execute_shell_command from bare command");
            record.insert("action".to_string(), Value::String(SHELL_ACTION.to_string()));
        } else {
            return unknown("Parsed JSON missing required key ('action', 'plan', or 'status')");
        }
    }
    record
}

fn plan_from_value(plan: &Value) -> Result<Vec<PlanStep>, String> {
    let items = plan.as_array().ok_or_else(|| "'plan' is not an array".to_string())?;
    if items.is_empty() {
        return Err("plan has no steps".to_string());
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            PlanStep::from_value(item).ok_or_else(|| format!("plan step {} has no action", i + 1))
        })
        .collect()
}

/// 按 plan > status > action 的优先级分类
pub fn interpret(text: &str) -> Interpretation {
    let record = parse_record(text);
    if is_unknown(&record) {
        return Interpretation::Unknown(unknown_reason(&record));
    }
    if let Some(plan) = record.get("plan") {
        return match plan_from_value(plan) {
            Ok(steps) => Interpretation::Plan(steps),
            Err(e) => Interpretation::InvalidPlan(e),
        };
    }
    if record.contains_key("status") {
        return Interpretation::Verdict(Verdict::from_record(&record));
    }
    Interpretation::Action(record)
}

/// 规划阶段：只接受非空且每步都有 action 的 plan
pub fn interpret_plan(text: &str) -> Result<Vec<PlanStep>, String> {
    match interpret(text) {
        Interpretation::Plan(steps) => Ok(steps),
        Interpretation::InvalidPlan(e) | Interpretation::Unknown(e) => Err(e),
        Interpretation::Verdict(_) | Interpretation::Action(_) => {
            Err("response does not contain a 'plan'".to_string())
        }
    }
}

/// 反思阶段：无法解析或缺少 status 时视为未成功
pub fn interpret_verdict(text: &str) -> Verdict {
    let record = parse_record(text);
    if is_unknown(&record) {
        return Verdict {
            status: "failure".to_string(),
            thought: String::new(),
            message: Some(unknown_reason(&record)),
        };
    }
    Verdict::from_record(&record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_text_yields_unknown() {
        for text in [
            "I will now list the directory.",
            "{\"action\": \"read_file\", \"file\": ",
            "{\"thought\": \"no keys I need\"}",
            "} backwards {",
            "",
        ] {
            let record = parse_record(text);
            assert!(is_unknown(&record), "{text}");
            assert!(!unknown_reason(&record).is_empty());
            assert!(matches!(interpret(text), Interpretation::Unknown(_)));
        }
        assert_eq!(
            unknown_reason(&parse_record("plain words")),
            "LLM response not in JSON format"
        );
        assert!(unknown_reason(&parse_record("{oops}")).starts_with("JSON decode error:"));
    }

    #[test]
    fn test_bare_command_is_shell_action() {
        let record = parse_record("Sure! {\"command\": \"ls -la\"} hope that helps");
        assert_eq!(record["action"], "execute_shell_command");
        assert_eq!(record["command"], "ls -la");
    }

    #[test]
    fn test_classifies_plan_verdict_and_action() {
        let plan = interpret(
            r#"```json
            {"plan": [{"action": "list_directory", "description": "look"}, {"action": "task_complete"}]}
            ```"#,
        );
        match plan {
            Interpretation::Plan(steps) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].description, "look");
            }
            other => panic!("expected plan, got {other:?}"),
        }

        match interpret(r#"{"status": "success", "thought": "fine"}"#) {
            Interpretation::Verdict(v) => assert!(v.is_success()),
            other => panic!("expected verdict, got {other:?}"),
        }

        match interpret(r#"{"action": "wait", "duration": 2}"#) {
            Interpretation::Action(r) => assert_eq!(r["duration"], 2),
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_or_malformed_plan_is_invalid() {
        assert!(matches!(interpret(r#"{"plan": []}"#), Interpretation::InvalidPlan(_)));
        assert!(matches!(interpret(r#"{"plan": "do stuff"}"#), Interpretation::InvalidPlan(_)));
        assert!(interpret_plan(r#"{"plan": [{"description": "no action"}]}"#).is_err());
        assert!(interpret_plan(r#"{"action": "wait"}"#).is_err());
    }

    #[test]
    fn test_unparseable_verdict_is_failure() {
        let v = interpret_verdict("looks good to me");
        assert!(!v.is_success());
        assert_eq!(v.message.as_deref(), Some("LLM response not in JSON format"));

        let v = interpret_verdict(r#"{"status": "failure", "thought": "t", "message": "file missing"}"#);
        assert!(!v.is_success());
        assert_eq!(v.message.as_deref(), Some("file missing"));
    }
}
