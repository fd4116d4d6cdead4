//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! - MockLlmClient：按提示词首行的阶段标记作答，能把一个任务完整跑到 completed
//! - ScriptedLlmClient：按顺序返回预设响应，并记录收到的每条提示词

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::LlmClient;
use crate::react::prompts::{classify_prompt, PromptKind};

/// Mock 客户端：计划固定为「列目录 -> 完成」，动作阶段照抄当前步骤
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    /// 从动作阶段提示词里的 `Action: xxx` 行取出当前步骤动作
    fn step_action(prompt: &str) -> &str {
        prompt
            .lines()
            .find_map(|l| l.trim().strip_prefix("Action:"))
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or("task_complete")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &str, _image: Option<&[u8]>) -> Result<String, String> {
        let reply = match classify_prompt(prompt) {
            PromptKind::Planning => json!({
                "plan": [
                    { "action": "list_directory", "path": ".", "description": "Look around the workspace" },
                    { "action": "task_complete", "description": "Finish" }
                ]
            }),
            PromptKind::Action => match Self::step_action(prompt) {
                "list_directory" => json!({ "action": "list_directory", "path": "." }),
                "task_complete" => json!({ "action": "task_complete", "reason": "mock run finished" }),
                other => json!({ "action": other }),
            },
            PromptKind::Reflection => json!({
                "status": "success",
                "thought": "The action completed as planned.",
                "message": "Action verified as successful."
            }),
            PromptKind::SelfEvaluation => json!({
                "success": true,
                "score": 8,
                "strengths": "Followed the plan.",
                "weaknesses": "None observed.",
                "improvements": "None.",
                "summary": "Mock run completed."
            }),
            PromptKind::Other => json!({ "action": "unknown", "error": "Echo from Mock" }),
        };
        Ok(reply.to_string())
    }
}

/// 脚本客户端：先取该阶段的响应队列，再取公共队列；都耗尽后依次回退到阶段 fallback、公共 fallback，
/// 最后返回空串（会被 gateway 降级为 unknown）
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<String>>,
    by_phase: Mutex<HashMap<PromptKind, VecDeque<String>>>,
    phase_fallback: HashMap<PromptKind, String>,
    fallback: Option<String>,
    error: Option<String>,
    prompts: Mutex<Vec<String>>,
    images: Mutex<usize>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// 为某一阶段追加响应队列
    pub fn with_phase(self, kind: PromptKind, responses: Vec<String>) -> Self {
        if let Ok(mut m) = self.by_phase.lock() {
            m.entry(kind).or_default().extend(responses);
        }
        self
    }

    /// 某一阶段的队列耗尽后一直返回该响应
    pub fn with_phase_fallback(mut self, kind: PromptKind, fallback: impl Into<String>) -> Self {
        self.phase_fallback.insert(kind, fallback.into());
        self
    }

    /// 所有队列耗尽后一直返回该响应
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// 每次调用都返回错误
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// 已收到的提示词（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }

    /// 收到的图片数量
    pub fn images_seen(&self) -> usize {
        self.images.lock().map(|n| *n).unwrap_or_default()
    }

    /// 指定阶段的调用次数
    pub fn calls_of(&self, kind: PromptKind) -> usize {
        self.prompts()
            .iter()
            .filter(|p| classify_prompt(p) == kind)
            .count()
    }

    fn next_response(&self, kind: PromptKind) -> String {
        let phased = self
            .by_phase
            .lock()
            .ok()
            .and_then(|mut m| m.get_mut(&kind).and_then(VecDeque::pop_front));
        phased
            .or_else(|| self.responses.lock().ok().and_then(|mut q| q.pop_front()))
            .or_else(|| self.phase_fallback.get(&kind).cloned())
            .or_else(|| self.fallback.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, image: Option<&[u8]>) -> Result<String, String> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        if image.is_some() {
            if let Ok(mut n) = self.images.lock() {
                *n += 1;
            }
        }
        if let Some(ref e) = self.error {
            return Err(e.clone());
        }
        Ok(self.next_response(classify_prompt(prompt)))
    }
}
