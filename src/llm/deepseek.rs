//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 完全兼容的 API 接口。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat；配置里的 model 不以 deepseek 开头时回退到它
//!
//! 注意 DeepSeek 目前不接受图片内容块，截图会被 gateway 之后的这一层丢弃。

use async_trait::async_trait;

use crate::llm::{LlmClient, OpenAiClient};

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// DeepSeek 客户端：纯文本的 OpenAI 兼容客户端
pub struct DeepSeekClient {
    inner: OpenAiClient,
}

impl DeepSeekClient {
    pub fn new(inner: OpenAiClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LlmClient for DeepSeekClient {
    fn name(&self) -> &str {
        "deepseek"
    }

    async fn complete(&self, prompt: &str, image: Option<&[u8]>) -> Result<String, String> {
        if image.is_some() {
            tracing::debug!("DeepSeek does not accept images, sending text only");
        }
        self.inner.complete(prompt, None).await
    }
}
