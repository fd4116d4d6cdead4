//! Critic：动作执行后的反思与任务完成后的自评
//!
//! reflect() 让 LLM 判断刚执行的动作是否完成了当前计划步骤；
//! self_evaluate() 在任务完成后请求一次整体评价，解析不出 JSON 时保留原文。

use serde_json::{Map, Value};

use crate::core::state::{AgentState, Outcome, PlanStep};
use crate::llm::OracleGateway;
use crate::react::interpreter::{interpret_verdict, Verdict};
use crate::react::prompts::{current_context, reflection_prompt, self_evaluation_prompt};

/// Critic：持有 LLM 网关
#[derive(Clone)]
pub struct Critic {
    gateway: OracleGateway,
}

impl Critic {
    pub fn new(gateway: OracleGateway) -> Self {
        Self { gateway }
    }

    /// 反思：task + 计划步骤 + 实际执行的记录 + 结果；image 为本步观察到的截图
    pub async fn reflect(
        &self,
        state: &AgentState,
        step: &PlanStep,
        executed: &Map<String, Value>,
        outcome: &Outcome,
        image: Option<&[u8]>,
    ) -> Verdict {
        let prompt = reflection_prompt(
            &state.current_task,
            step,
            executed,
            outcome,
            &current_context(state),
        );
        let verdict = interpret_verdict(&self.gateway.call(&prompt, image).await);
        tracing::info!(
            action = %step.action,
            status = %verdict.status,
            thought = %verdict.thought,
            "Reflection verdict"
        );
        verdict
    }

    /// 自评：返回 LLM 给出的 JSON 对象，无法解析时为 {"raw_response": 原文}
    pub async fn self_evaluate(&self, state: &AgentState) -> Value {
        let response = self.gateway.call(&self_evaluation_prompt(state), None).await;
        let parsed = match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<Value>(&response[start..=end]).ok()
            }
            _ => None,
        };
        match parsed {
            Some(v @ Value::Object(_)) => v,
            _ => {
                tracing::warn!("Self-evaluation response is not JSON, keeping raw text");
                serde_json::json!({ "raw_response": response })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};

    #[tokio::test]
    async fn test_reflect_reads_verdict() {
        let critic = Critic::new(OracleGateway::new(Arc::new(ScriptedLlmClient::new(vec![
            r#"{"status": "failure", "thought": "nothing happened", "message": "window not found"}"#
                .to_string(),
        ]))));
        let step = PlanStep::new("focus_window", "bring up notepad");
        let verdict = critic
            .reflect(
                &AgentState::default(),
                &step,
                &step.to_record(),
                &Outcome::failure("Could not find or focus window"),
                None,
            )
            .await;
        assert!(!verdict.is_success());
        assert_eq!(verdict.message.as_deref(), Some("window not found"));
    }

    #[tokio::test]
    async fn test_self_evaluate_keeps_raw_text() {
        let critic = Critic::new(OracleGateway::new(Arc::new(ScriptedLlmClient::new(vec![
            "It went fine overall.".to_string(),
        ]))));
        let eval = critic.self_evaluate(&AgentState::default()).await;
        assert_eq!(eval["raw_response"], "It went fine overall.");

        let critic = Critic::new(OracleGateway::new(Arc::new(MockLlmClient)));
        let eval = critic.self_evaluate(&AgentState::default()).await;
        assert_eq!(eval["score"], 8);
    }
}
