//! Google Gemini 客户端（generateContent REST 接口）
//!
//! 一次请求一个 user content：text part + 可选 inline_data 图片 part。
//! 非 2xx 响应以 `HTTP <status>: <body>` 形式返回错误，配额类错误交给 gateway 识别。

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};

use crate::llm::traits::image_mime;
use crate::llm::LlmClient;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url
                .unwrap_or(GEMINI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            temperature: 0.7,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn request_body(&self, prompt: &str, image: Option<&[u8]>) -> Value {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(bytes) = image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image_mime(bytes).unwrap_or("image/png"),
                    "data": STANDARD.encode(bytes),
                }
            }));
        }
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "temperature": self.temperature },
        })
    }
}

/// 取 candidates[0].content.parts 中所有 text 拼接
fn extract_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, image: Option<&[u8]>) -> Result<String, String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, image))
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, text));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| format!("Invalid JSON: {}", e))?;
        Ok(extract_text(&body).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_with_image() {
        let client = GeminiClient::new(None, "m", "k", Duration::from_secs(1)).with_temperature(0.2);
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let body = client.request_body("hi", Some(&png));
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "hi");
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"a\":" }, { "text": "1}" }] } }]
        });
        assert_eq!(extract_text(&body).as_deref(), Some("{\"a\":1}"));
        assert_eq!(extract_text(&json!({ "candidates": [] })), None);
    }
}
