//! Planner：规划与动作参数化
//!
//! plan() 请求整份计划，next_action() 为当前步骤请求具体参数；两者都只做一次 LLM 调用，
//! 重试与预算由编排循环负责。

use serde_json::{Map, Value};

use crate::core::state::{AgentState, PlanStep};
use crate::core::AgentError;
use crate::llm::OracleGateway;
use crate::react::interpreter::{interpret_plan, parse_record};
use crate::react::prompts::{action_prompt, current_context, planning_prompt};

/// Planner：持有 LLM 网关与历史窗口大小
#[derive(Clone)]
pub struct Planner {
    gateway: OracleGateway,
    history_window: usize,
}

impl Planner {
    pub fn new(gateway: OracleGateway, history_window: usize) -> Self {
        Self {
            gateway,
            history_window,
        }
    }

    pub fn gateway(&self) -> &OracleGateway {
        &self.gateway
    }

    /// 为 task 生成计划；空计划或格式不对时返回 PlanGeneration
    pub async fn plan(&self, task: &str, state: &AgentState) -> Result<Vec<PlanStep>, AgentError> {
        let prompt = planning_prompt(
            task,
            &current_context(state),
            state.recent_history(self.history_window),
        );
        let response = self.gateway.call(&prompt, None).await;
        match interpret_plan(&response) {
            Ok(plan) => {
                tracing::info!(task = %task, steps = plan.len(), "Plan generated");
                for (i, step) in plan.iter().enumerate() {
                    tracing::debug!(step = i + 1, action = %step.action, description = %step.description, "plan step");
                }
                Ok(plan)
            }
            Err(e) => {
                tracing::error!(task = %task, error = %e, "Failed to generate a usable plan");
                Err(AgentError::PlanGeneration(e))
            }
        }
    }

    /// 为当前步骤请求参数；解析失败时返回 unknown 哨兵记录
    pub async fn next_action(
        &self,
        state: &AgentState,
        step: &PlanStep,
        image: Option<&[u8]>,
    ) -> Map<String, Value> {
        let prompt = action_prompt(state, step, self.history_window);
        let response = self.gateway.call(&prompt, image).await;
        parse_record(&response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::react::interpreter::is_unknown;
    use crate::react::prompts::PromptKind;

    fn planner(client: ScriptedLlmClient) -> Planner {
        Planner::new(OracleGateway::new(Arc::new(client)), 5)
    }

    #[tokio::test]
    async fn test_plan_parses_steps() {
        let p = planner(ScriptedLlmClient::new(vec![
            r#"{"plan": [{"action": "wait", "duration": 1, "description": "pause"}]}"#.to_string(),
        ]));
        let plan = p.plan("pause a bit", &AgentState::default()).await.unwrap();
        assert_eq!(plan, vec![PlanStep::new("wait", "pause").with_param("duration", 1)]);
    }

    #[tokio::test]
    async fn test_empty_plan_is_generation_failure() {
        let p = planner(ScriptedLlmClient::new(vec![r#"{"plan": []}"#.to_string()]));
        let err = p.plan("anything", &AgentState::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::PlanGeneration(_)));
    }

    #[tokio::test]
    async fn test_next_action_sends_image_and_flags_garbage() {
        let client = Arc::new(
            ScriptedLlmClient::new(vec![]).with_phase(PromptKind::Action, vec!["no json here".to_string()]),
        );
        let p = Planner::new(OracleGateway::new(client.clone()), 5);
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let record = p
            .next_action(&AgentState::default(), &PlanStep::new("wait", ""), Some(&png))
            .await;
        assert!(is_unknown(&record));
        assert_eq!(client.images_seen(), 1);
    }
}
