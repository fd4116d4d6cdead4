//! Oracle 网关：对 LlmClient 的一次调用做统一降级与诊断
//!
//! call() 永不返回错误：未配置客户端、空响应、上游错误（含配额 / 限流）都降级为
//! `{"action": "unknown", "error": ...}` 文本，下游解析可以统一分支。
//! 调用计数与时间戳由网关实例持有的 CallStats 维护（可注入、可在测试中单独观察）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use crate::core::state::preview;
use crate::llm::traits::image_mime;
use crate::llm::LlmClient;

/// 时间戳最多保留条数
const MAX_TIMESTAMPS: usize = 100;
/// 每次调用时在日志中展示的最近调用数
const RECENT_CALLS_SHOWN: usize = 5;
/// 提示词日志预览长度
const PROMPT_PREVIEW_CHARS: usize = 500;
const RESPONSE_PREVIEW_CHARS: usize = 200;

const RATE_LIMIT_KEYWORDS: &[&str] = &["quota", "rate limit", "429", "exceeded", "too many requests"];

/// 调用诊断：累计次数 + 最近调用时间
#[derive(Debug, Default)]
pub struct CallStats {
    count: AtomicU64,
    timestamps: Mutex<VecDeque<DateTime<Local>>>,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次调用，返回本次序号
    pub fn record(&self) -> u64 {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut ts) = self.timestamps.lock() {
            ts.push_back(Local::now());
            while ts.len() > MAX_TIMESTAMPS {
                ts.pop_front();
            }
        }
        n
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// 最近 n 次调用时间（旧 -> 新）
    pub fn recent(&self, n: usize) -> Vec<DateTime<Local>> {
        match self.timestamps.lock() {
            Ok(ts) => ts.iter().rev().take(n).rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// 构造 unknown 哨兵记录文本
pub fn unknown_record(error: impl Into<String>) -> String {
    serde_json::json!({ "action": "unknown", "error": error.into() }).to_string()
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Oracle 网关：可选的 LlmClient + 调用统计
#[derive(Clone)]
pub struct OracleGateway {
    client: Option<Arc<dyn LlmClient>>,
    stats: Arc<CallStats>,
}

impl OracleGateway {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client: Some(client),
            stats: Arc::new(CallStats::new()),
        }
    }

    /// 未配置后端（缺少 API Key 等）：每次调用都降级为 unknown
    pub fn unconfigured() -> Self {
        Self {
            client: None,
            stats: Arc::new(CallStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<CallStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<CallStats> {
        self.stats.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// 发送提示词（可附截图），返回原始文本或 unknown 哨兵文本
    pub async fn call(&self, prompt: &str, image: Option<&[u8]>) -> String {
        let Some(client) = self.client.as_ref() else {
            tracing::error!("LLM client is not configured. Cannot make API call.");
            return unknown_record("LLM not configured");
        };

        let image = match image {
            Some(bytes) if image_mime(bytes).is_some() => Some(bytes),
            Some(bytes) => {
                tracing::error!(len = bytes.len(), "Image payload is not a recognized image, sending prompt without it");
                None
            }
            None => None,
        };

        tracing::info!(
            backend = client.name(),
            with_image = image.is_some(),
            "Sending prompt to LLM (first {} chars): {}",
            PROMPT_PREVIEW_CHARS,
            preview(prompt, PROMPT_PREVIEW_CHARS)
        );
        let n = self.stats.record();
        tracing::info!("LLM CALL #{} at {}", n, Local::now().format("%Y-%m-%d %H:%M:%S"));
        if n > 1 {
            let recent: Vec<String> = self
                .stats
                .recent(RECENT_CALLS_SHOWN)
                .iter()
                .map(|t| t.format("%H:%M:%S").to_string())
                .collect();
            tracing::info!("Last {} LLM call times: {:?}", RECENT_CALLS_SHOWN, recent);
        }

        match client.complete(prompt, image).await {
            Ok(text) if text.trim().is_empty() => {
                tracing::error!("LLM returned empty response");
                unknown_record("LLM returned empty response")
            }
            Ok(text) => {
                tracing::info!(
                    "Received LLM response (first {} chars): {}",
                    RESPONSE_PREVIEW_CHARS,
                    preview(&text, RESPONSE_PREVIEW_CHARS)
                );
                text
            }
            Err(e) if is_rate_limited(&e) => {
                tracing::error!(error = %e, "LLM quota/rate limit error");
                unknown_record(format!("LLM quota/rate limit error: {}", e))
            }
            Err(e) => {
                tracing::error!(error = %e, "Error calling LLM API");
                unknown_record(format!("LLM API error: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn parse(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_unconfigured_degrades_to_unknown() {
        let gateway = OracleGateway::unconfigured();
        let out = parse(&gateway.call("hello", None).await);
        assert_eq!(out["action"], "unknown");
        assert_eq!(out["error"], "LLM not configured");
        assert_eq!(gateway.stats().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_response_degrades() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["   ".to_string()]));
        let gateway = OracleGateway::new(llm);
        let out = parse(&gateway.call("hello", None).await);
        assert_eq!(out["action"], "unknown");
        assert_eq!(gateway.stats().count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_error_is_labelled() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]).with_error("HTTP 429: Too Many Requests"));
        let gateway = OracleGateway::new(llm);
        let out = parse(&gateway.call("hello", None).await);
        assert!(out["error"].as_str().unwrap().starts_with("LLM quota/rate limit error"));
    }

    #[tokio::test]
    async fn test_malformed_image_is_dropped() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["ok".to_string()]));
        let gateway = OracleGateway::new(llm.clone());
        let out = gateway.call("hello", Some(b"garbage")).await;
        assert_eq!(out, "ok");
        assert_eq!(llm.images_seen(), 0);
    }

    #[test]
    fn test_stats_are_per_instance() {
        let a = OracleGateway::unconfigured();
        let b = OracleGateway::unconfigured();
        a.stats().record();
        a.stats().record();
        assert_eq!(a.stats().count(), 2);
        assert_eq!(b.stats().count(), 0);
        assert_eq!(a.stats().recent(5).len(), 2);
    }
}
