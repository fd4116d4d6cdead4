//! Web 搜索协作者：Google Custom Search + 首条结果正文摘要
//!
//! 先调 Custom Search JSON API 拿结果列表，再抓取第一条结果页面：
//! 取 `<p>` 段落中长度超过 40 字符的部分，取不到时对整页使用 html2text 提取可读文本；
//! 结果超过 max_result_chars 时截断。凭据缺失或请求失败都返回说明文字，不返回错误。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

use crate::config::SearchSection;

const CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";
/// 段落最短长度（更短的多为导航、按钮文字）
const MIN_PARAGRAPH_CHARS: usize = 40;

/// Web 搜索协作者
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn query(&self, text: &str, num_results: usize) -> String;
}

/// Google Custom Search 实现
pub struct GoogleCseSearch {
    client: Client,
    api_key: Option<String>,
    engine_id: Option<String>,
    max_result_chars: usize,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn paragraph_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<p(?:\s[^>]*)?>(.*?)</p>").ok())
        .as_ref()
}

/// 提取页面正文：长段落优先，其次整页文本
pub fn extract_readable(html: &str) -> String {
    let paragraphs: Vec<String> = paragraph_re()
        .map(|re| {
            re.captures_iter(html)
                .filter_map(|c| c.get(1))
                .map(|m| strip_html_tags(m.as_str()))
                .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
                .collect()
        })
        .unwrap_or_default();
    if !paragraphs.is_empty() {
        return paragraphs.join("\n");
    }
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl GoogleCseSearch {
    pub fn new(
        api_key: Option<String>,
        engine_id: Option<String>,
        timeout_secs: u64,
        max_result_chars: usize,
    ) -> Self {
        const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            engine_id: engine_id.filter(|k| !k.is_empty()),
            max_result_chars,
        }
    }

    /// 凭据从 [tools.search] 指定的环境变量读取
    pub fn from_config(cfg: &SearchSection) -> Self {
        Self::new(
            std::env::var(&cfg.api_key_env).ok(),
            std::env::var(&cfg.engine_id_env).ok(),
            cfg.timeout_secs,
            cfg.max_result_chars,
        )
    }

    async fn search(&self, key: &str, cx: &str, text: &str, num: usize) -> Result<String, String> {
        let num = num.clamp(1, 10).to_string();
        let resp = self
            .client
            .get(CSE_URL)
            .query(&[("key", key), ("cx", cx), ("q", text), ("num", num.as_str())])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let data: Value = resp.json().await.map_err(|e| format!("Invalid JSON: {}", e))?;
        let Some(url) = data
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("link"))
            .and_then(Value::as_str)
        else {
            tracing::warn!(query = %text, "No web results found");
            return Ok("No web results found.".to_string());
        };
        tracing::info!(query = %text, url = %url, "Top search result");

        let page = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Fetch failed: {}", e))?;
        if !page.status().is_success() {
            return Err(format!("HTTP {}", page.status()));
        }
        let body = page.text().await.map_err(|e| format!("Read body: {}", e))?;
        let text = extract_readable(body.trim_start_matches('\u{FEFF}'));
        if text.trim().is_empty() {
            return Ok("No readable content found.".to_string());
        }
        Ok(truncate_chars(&text, self.max_result_chars))
    }
}

#[async_trait]
impl WebSearch for GoogleCseSearch {
    async fn query(&self, text: &str, num_results: usize) -> String {
        let (Some(key), Some(cx)) = (self.api_key.as_deref(), self.engine_id.as_deref()) else {
            return "Google Custom Search API key or engine ID not set. Set GOOGLE_CSE_API_KEY and GOOGLE_CSE_ID in the environment.".to_string();
        };
        match self.search(key, cx, text, num_results).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(query = %text, error = %e, "Web search failed");
                format!("Web search failed: {}", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keeps_long_paragraphs_only() {
        let html = r#"<html><body><p>short</p>
            <p class="lead">This paragraph is comfortably longer than forty characters in total.</p>
            <div>menu</div></body></html>"#;
        let text = extract_readable(html);
        assert_eq!(
            text,
            "This paragraph is comfortably longer than forty characters in total."
        );
    }

    #[test]
    fn test_extract_falls_back_to_page_text() {
        let text = extract_readable("<html><body><div>Only a div here</div></body></html>");
        assert!(text.contains("Only a div here"));
    }

    #[tokio::test]
    async fn test_missing_credentials_explains() {
        let search = GoogleCseSearch::new(None, None, 1, 1000);
        let out = search.query("rust", 3).await;
        assert!(out.contains("not set"));
    }
}
