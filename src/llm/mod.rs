//! LLM 层：客户端抽象、Oracle 网关与各后端实现（Gemini / OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod gateway;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;

pub use deepseek::{DeepSeekClient, DEEPSEEK_CHAT};
pub use gateway::{unknown_record, CallStats, OracleGateway};
pub use gemini::GeminiClient;
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::LlmClient;

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

/// 根据 [llm] 配置构建 Oracle 网关
///
/// 缺少对应的 API Key 时返回未配置的网关（每次调用降级为 unknown），不视为启动错误。
pub fn create_llm_from_config(cfg: &LlmSection) -> OracleGateway {
    let timeout = Duration::from_secs(cfg.timeouts.request);
    let provider = cfg.provider.trim().to_lowercase();
    let client: Option<Arc<dyn LlmClient>> = match provider.as_str() {
        "mock" => Some(Arc::new(MockLlmClient)),
        "openai" => env_key("OPENAI_API_KEY").map(|key| {
            Arc::new(
                OpenAiClient::new(cfg.base_url.as_deref(), &cfg.model, &key)
                    .with_temperature(cfg.temperature)
                    .with_timeout(timeout),
            ) as Arc<dyn LlmClient>
        }),
        "deepseek" => env_key("DEEPSEEK_API_KEY").map(|key| {
            let model = if cfg.model.starts_with("deepseek") {
                cfg.model.as_str()
            } else {
                DEEPSEEK_CHAT
            };
            let base = cfg.base_url.as_deref().unwrap_or(deepseek::DEEPSEEK_BASE_URL);
            Arc::new(DeepSeekClient::new(
                OpenAiClient::new(Some(base), model, &key)
                    .with_temperature(cfg.temperature)
                    .with_timeout(timeout),
            )) as Arc<dyn LlmClient>
        }),
        "gemini" | "google" => env_key("GOOGLE_API_KEY").map(|key| {
            Arc::new(
                GeminiClient::new(cfg.base_url.as_deref(), &cfg.model, &key, timeout)
                    .with_temperature(cfg.temperature),
            ) as Arc<dyn LlmClient>
        }),
        other => {
            tracing::error!(provider = %other, "Unknown LLM provider");
            None
        }
    };

    match client {
        Some(c) => {
            tracing::info!(provider = %provider, model = %cfg.model, "LLM client configured");
            OracleGateway::new(c)
        }
        None => {
            tracing::warn!(provider = %provider, "LLM client not configured (missing API key?); oracle calls will return unknown");
            OracleGateway::unconfigured()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider_is_configured() {
        let cfg = LlmSection {
            provider: "mock".to_string(),
            ..LlmSection::default()
        };
        assert!(create_llm_from_config(&cfg).is_configured());
    }

    #[test]
    fn test_unknown_provider_is_unconfigured() {
        let cfg = LlmSection {
            provider: "nope".to_string(),
            ..LlmSection::default()
        };
        assert!(!create_llm_from_config(&cfg).is_configured());
    }
}
