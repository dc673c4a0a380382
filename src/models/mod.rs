//! 对话消息模型
//!
//! 与流式接口约定的 OpenAI 风格消息格式：`content` 为纯文本，
//! 或带图片时为 `text` / `image_url` 片段数组。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// 图片地址（data URL）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// 多模态消息片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// 消息内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// 纯文本
    Text(String),
    /// 多模态片段
    Parts(Vec<ContentPart>),
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// 对话消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// 纯文本内容；多模态消息返回 None
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(_) => None,
        }
    }

    /// 能否作为历史上下文发送（纯文本的用户 / 助手消息）
    pub fn is_history_candidate(&self) -> bool {
        matches!(self.role, MessageRole::User | MessageRole::Assistant) && self.text().is_some()
    }
}

// ============================================================================
// 附件
// ============================================================================

/// 附件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

/// 用户消息附件
///
/// 只有图片附件会随请求发送。
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Attachment {
    /// 图片附件，MIME 为空时按 `image/png` 处理
    pub fn image(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        let mime_type = mime_type.into();
        let name = name.into();
        Self {
            kind: AttachmentKind::Image,
            name: if name.is_empty() { "image".to_string() } else { name },
            mime_type: if mime_type.is_empty() {
                "image/png".to_string()
            } else {
                mime_type
            },
            data,
        }
    }

    /// 普通文件附件
    pub fn file(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::File,
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }

    /// `data:<mime>;base64,<data>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }
}

/// 构建用户消息
///
/// 有图片附件时内容变为文本片段加图片片段，否则为纯文本。
pub fn build_user_message(text: &str, attachments: &[Attachment]) -> ChatMessage {
    let images: Vec<ContentPart> = attachments
        .iter()
        .filter(|a| a.is_image())
        .map(|a| ContentPart::ImageUrl {
            image_url: ImageUrl { url: a.data_url() },
        })
        .collect();

    if images.is_empty() {
        return ChatMessage::user(text);
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    parts.push(ContentPart::Text {
        text: text.to_string(),
    });
    parts.extend(images);
    ChatMessage::user(MessageContent::Parts(parts))
}
