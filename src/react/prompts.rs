//! 提示词组装：规划 / 动作参数化 / 反思 / 自评四个阶段
//!
//! 每条提示词首行是阶段标记（`### PLANNING PHASE` 等），classify_prompt 据此识别阶段，
//! Mock 与测试桩都依赖这一点按阶段作答。

use serde_json::Value;

use crate::core::state::{preview, ActionRecord, AgentState, Outcome, PlanStep};
use crate::tools::actions::ActionKind;

pub const PLANNING_MARKER: &str = "### PLANNING PHASE";
pub const ACTION_MARKER: &str = "### ACTION EXECUTION PHASE";
pub const REFLECTION_MARKER: &str = "### REFLECTION PHASE";
pub const SELF_EVALUATION_MARKER: &str = "### SELF-EVALUATION PHASE";

const BASE_INSTRUCTION: &str = "You are an AI agent that operates a computer on behalf of the user. \
Understand the task precisely and carry it out with the available tools.";

/// 自评时带入的历史条数
const SELF_EVAL_HISTORY: usize = 10;
/// 上下文摘要里读取内容的预览长度
const CONTEXT_READ_PREVIEW: usize = 200;

/// 提示词所属阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Planning,
    Action,
    Reflection,
    SelfEvaluation,
    Other,
}

/// 按首个非空行判断阶段
pub fn classify_prompt(prompt: &str) -> PromptKind {
    let first = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    match first {
        PLANNING_MARKER => PromptKind::Planning,
        ACTION_MARKER => PromptKind::Action,
        REFLECTION_MARKER => PromptKind::Reflection,
        SELF_EVALUATION_MARKER => PromptKind::SelfEvaluation,
        _ => PromptKind::Other,
    }
}

/// 工具说明（规划阶段使用），带当前平台
pub fn tools_description() -> String {
    let mut out = format!(
        "Available tools (current platform: {}). Respond with a JSON object holding 'action' and its parameters.\n",
        std::env::consts::OS
    );
    for kind in ActionKind::ALL {
        out.push_str(&format!("- {}: {}\n", kind.as_str(), kind.usage()));
    }
    out.push_str(
        "- decompose_subtask(subtask_description: str): break a complex step into its own plan and run it.\n  \
         Example: {\"action\": \"decompose_subtask\", \"subtask_description\": \"Draw a circle in Paint\"}\n",
    );
    out
}

/// 当前观察摘要：上次反馈、读取内容、目录、检索到的知识
pub fn current_context(state: &AgentState) -> String {
    let mut lines = Vec::new();
    if let Some(ref fb) = state.last_action_feedback {
        lines.push(format!("Last action feedback: {}", fb.to_prompt_json()));
    }
    if let Some(ref content) = state.last_read_content {
        lines.push(format!(
            "Last file content read: {}",
            preview(content, CONTEXT_READ_PREVIEW)
        ));
    }
    if let Some(ref list) = state.last_directory_list {
        lines.push(format!("Last directory listing: {:?}", list));
    }
    if let Some(ref knowledge) = state.last_retrieved_knowledge {
        lines.push(format!("Last retrieved knowledge: {}", knowledge));
    }
    if let Some(ref feedback) = state.last_feedback {
        lines.push(format!("Latest user feedback: {}", feedback));
    }
    if let Some(ref q) = state.pending_user_question {
        lines.push(format!("Waiting for the user to answer: {}", q));
    }
    if lines.is_empty() {
        "No specific observations yet.".to_string()
    } else {
        lines.join("\n")
    }
}

fn history_lines(history: &[ActionRecord]) -> String {
    if history.is_empty() {
        return "No recent history.".to_string();
    }
    history
        .iter()
        .map(|h| {
            format!(
                "- {} (Result: {})",
                h.action_name(),
                h.status.map(|s| s.as_str()).unwrap_or("no feedback")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn or_none(value: Option<String>) -> String {
    value.unwrap_or_else(|| "None".to_string())
}

/// 规划阶段提示词
pub fn planning_prompt(task: &str, context: &str, history: &[ActionRecord]) -> String {
    let allowed = ActionKind::ALL
        .iter()
        .map(|k| format!("\"{}\"", k.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"{marker}
{base}

Break the main task into a short sequence of concrete steps. Each step names exactly one tool and says briefly what it is for.

Task: "{task}"

Current observations:
{context}

{tools}
Only these actions may appear in the plan: {allowed}, plus "decompose_subtask" for steps that need their own plan. Prefer shell commands when they can do the job.

Recent action history:
{history}

Before finishing, consider capturing the screen to confirm the result, then end the plan with "task_complete".

Answer with a JSON object whose "plan" key is an array of steps. Every step must carry "action" and "description"; add any parameters you already know.
Example:
{{"plan": [
  {{"action": "list_directory", "path": ".", "description": "See what is in the working directory."}},
  {{"action": "write_file", "file": "notes.txt", "content": "hello", "description": "Create the notes file."}},
  {{"action": "task_complete", "description": "The task is done."}}
]}}
Reply with the JSON only."#,
        marker = PLANNING_MARKER,
        base = BASE_INSTRUCTION,
        task = task,
        context = context,
        tools = tools_description(),
        allowed = allowed,
        history = history_lines(history),
    )
}

/// 动作参数化阶段提示词（首个 `Action:` 行是当前步骤的动作名）
pub fn action_prompt(state: &AgentState, step: &PlanStep, history_window: usize) -> String {
    let last_feedback = state
        .last_action_feedback
        .as_ref()
        .map(Outcome::to_prompt_json)
        .unwrap_or_else(|| r#"{"status": "none", "message": "No previous action feedback."}"#.to_string());
    let failed = if state.failed_steps.is_empty() {
        "None".to_string()
    } else {
        state
            .failed_steps
            .iter()
            .map(|(k, v)| format!("Step: {}, Failures: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let succeeded = if state.successful_steps.is_empty() {
        "None".to_string()
    } else {
        state.successful_steps.join("\n")
    };
    let description = if step.description.is_empty() {
        "No description provided."
    } else {
        step.description.as_str()
    };

    format!(
        r#"{marker}
Action: {action}
Description: {description}
Parameters from plan: {params}

{base}
You are executing one step of your plan. Provide the exact parameters for the tool named above.
Your reply MUST be a single JSON object that includes the "action" key; replies without it are discarded.
Consider capturing the screen before using "task_complete" to confirm the task is really finished.

Overall task: "{task}"

Last action feedback: {last_feedback}
Last read content: {read}
Last directory list: {dir}
Last retrieved knowledge: {knowledge}
Latest user feedback: {user_feedback}

Recent action history:
{history}
Failed steps:
{failed}
Successful steps:
{succeeded}

Valid reply:
{{"action": "execute_shell_command", "command": "ls -la", "background": false}}
Invalid reply (missing "action"):
{{"command": "ls -la"}}
Reply with the JSON only."#,
        marker = ACTION_MARKER,
        action = step.action,
        description = description,
        params = Value::Object(step.parameters.clone()),
        base = BASE_INSTRUCTION,
        task = state.current_task,
        last_feedback = last_feedback,
        read = or_none(state.last_read_content.clone()),
        dir = or_none(state.last_directory_list.as_ref().map(|l| format!("{:?}", l))),
        knowledge = or_none(state.last_retrieved_knowledge.clone()),
        user_feedback = or_none(state.last_feedback.clone()),
        history = history_lines(state.recent_history(history_window)),
        failed = failed,
        succeeded = succeeded,
    )
}

/// 反思阶段提示词
pub fn reflection_prompt(
    task: &str,
    step: &PlanStep,
    executed: &serde_json::Map<String, Value>,
    outcome: &Outcome,
    context: &str,
) -> String {
    let executed_name = executed
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    format!(
        r#"{marker}
You just executed the action "{executed_name}".
Action record: {executed}
Action result: {outcome}
Overall task: {task}
Current plan step: {step}

Current observations:
{context}

Judge from the result whether the action worked and this plan step is done. Be practical: if the goal of the step is reasonably met, count it as done.
Reply with ONLY a JSON object holding "status" ("success" or "failure"), "thought" with your reasoning, and optionally "message" describing any problem.
Example: {{"status": "success", "thought": "The file was written with the expected content."}}"#,
        marker = REFLECTION_MARKER,
        executed_name = executed_name,
        executed = Value::Object(executed.clone()),
        outcome = outcome.to_prompt_json(),
        task = task,
        step = serde_json::to_string(step).unwrap_or_else(|_| step.action.clone()),
        context = context,
    )
}

/// 自评阶段提示词：任务 + 最近历史 + 最终状态
pub fn self_evaluation_prompt(state: &AgentState) -> String {
    let final_state = serde_json::to_string_pretty(&strip_screenshot(state))
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        r#"{marker}
{base}

The task has been completed. Give a critical evaluation of how you performed.
Task: "{task}"

Recent action history (last {n} steps):
{history}

Final agent state:
{final_state}

Answer these points: did you accomplish the task and why; what went well and what could improve; any mistakes or unnecessary steps; what you would do differently; a score from 1 (poor) to 10 (excellent).
Reply with ONLY a JSON object with keys "success" (true/false), "score" (1-10), "strengths", "weaknesses", "improvements" and "summary"."#,
        marker = SELF_EVALUATION_MARKER,
        base = BASE_INSTRUCTION,
        task = state.current_task,
        n = SELF_EVAL_HISTORY,
        history = history_lines(state.recent_history(SELF_EVAL_HISTORY)),
        final_state = final_state,
    )
}

/// 截图字节不进提示词
fn strip_screenshot(state: &AgentState) -> AgentState {
    let mut s = state.clone();
    s.last_screenshot_bytes = None;
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_prompt_is_classified_by_its_marker() {
        let mut state = AgentState::default();
        state.begin_run("write a file");
        let step = PlanStep::new("write_file", "write it").with_param("file", "a.txt");
        let outcome = Outcome::success("ok");

        assert_eq!(
            classify_prompt(&planning_prompt("t", "ctx", &[])),
            PromptKind::Planning
        );
        assert_eq!(
            classify_prompt(&action_prompt(&state, &step, 5)),
            PromptKind::Action
        );
        assert_eq!(
            classify_prompt(&reflection_prompt("t", &step, &step.to_record(), &outcome, "ctx")),
            PromptKind::Reflection
        );
        assert_eq!(
            classify_prompt(&self_evaluation_prompt(&state)),
            PromptKind::SelfEvaluation
        );
        assert_eq!(classify_prompt("hello"), PromptKind::Other);
    }

    #[test]
    fn test_action_prompt_names_step_first() {
        let state = AgentState::default();
        let step = PlanStep::new("list_directory", "");
        let prompt = action_prompt(&state, &step, 5);
        let first_action = prompt
            .lines()
            .find_map(|l| l.strip_prefix("Action:"))
            .map(str::trim);
        assert_eq!(first_action, Some("list_directory"));
        assert!(prompt.contains("No description provided."));
    }

    #[test]
    fn test_planning_prompt_lists_allowed_actions() {
        let prompt = planning_prompt("t", "ctx", &[]);
        for kind in ActionKind::ALL {
            assert!(prompt.contains(kind.as_str()));
        }
        assert!(prompt.contains("decompose_subtask"));
    }

    #[test]
    fn test_context_defaults_when_empty() {
        assert_eq!(
            current_context(&AgentState::default()),
            "No specific observations yet."
        );
    }
}
