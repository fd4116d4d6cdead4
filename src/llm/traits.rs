//! LLM 客户端抽象
//!
//! 所有后端（Gemini / OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：一次请求 = 一段提示词 + 可选截图。
//! 后端只负责把请求发出去并返回原始文本；重试、降级与计数都不在这一层。

use async_trait::async_trait;

/// LLM 客户端 trait：文本（+ 可选图片）进，原始文本出
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发送一次请求；image 为已校验过的 PNG / JPEG 等图片字节
    async fn complete(&self, prompt: &str, image: Option<&[u8]>) -> Result<String, String>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}

/// 根据文件头判断图片 MIME；不是已知图片格式时返回 None
pub fn image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"BM") && bytes.len() > 14 {
        Some("image/bmp")
    } else {
        None
    }
}
