use serde::{Deserialize, Serialize};

/**
 * \brief 会话首条固定问候语，仅用于展示，不作为上下文上送。
 */
pub const FIRST_MESSAGE: &str =
    "Hi! I'm your coding assistant. Ask me anything about this problem or your code.";

/**
 * \brief 消息角色，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 内联图片（题目截图），data 为 base64。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    /** \brief 由原始字节构造。 */
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        use base64::{engine::general_purpose, Engine as _};
        Self {
            mime_type: mime_type.to_string(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/**
 * \brief 多段消息中的一段。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: InlineImage },
}

/**
 * \brief 消息内容：纯文本或多段结构。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /** \brief 拼接全部文本段，图片段忽略。 */
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    pub fn images(&self) -> Vec<&InlineImage> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Image { image } => Some(image),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/**
 * \brief 对话消息。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

/**
 * \brief 单次练习中的对话，首条恒为固定问候语，仅追加。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::assistant(FIRST_MESSAGE)],
        }
    }

    /**
     * \brief 由外部传入的历史恢复会话；缺失问候语时自动补齐。
     */
    pub fn from_history(history: Vec<ChatMessage>) -> Self {
        let mut session = Self::new();
        let greeting = session.messages[0].clone();
        let rest = match history.first() {
            Some(first) if *first == greeting => &history[1..],
            _ => &history[..],
        };
        session.messages.extend(rest.iter().cloned());
        session
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(text));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /** \brief 去除问候语后的历史，用于上送。 */
    pub fn history(&self) -> &[ChatMessage] {
        &self.messages[1..]
    }
}

/**
 * \brief 题目上下文，由题目实体提供，只读。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemContext {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub image: Option<InlineImage>,
}

/**
 * \brief 代码上下文，由编辑器提供，只读。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeContext {
    pub source_code: String,
    pub language_tag: String,
}
