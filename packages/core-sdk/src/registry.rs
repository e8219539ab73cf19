use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/**
 * \brief 已支持的模型服务标识。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderId {
    OpenAi,
    Gemini,
    DeepSeek,
    Claude,
    Perplexity,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::OpenAi,
        ProviderId::Gemini,
        ProviderId::DeepSeek,
        ProviderId::Claude,
        ProviderId::Perplexity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OPENAI",
            ProviderId::Gemini => "GEMINI",
            ProviderId::DeepSeek => "DEEPSEEK",
            ProviderId::Claude => "CLAUDE",
            ProviderId::Perplexity => "PERPLEXITY",
        }
    }

    /** \brief 该服务凭据所在的数据表。 */
    pub fn config_table(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai_config",
            ProviderId::Gemini => "gemini_config",
            ProviderId::DeepSeek => "deepseek_config",
            ProviderId::Claude => "claude_config",
            ProviderId::Perplexity => "perplexity_config",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "gemini" | "google" => Ok(ProviderId::Gemini),
            "deepseek" => Ok(ProviderId::DeepSeek),
            "claude" | "anthropic" => Ok(ProviderId::Claude),
            "perplexity" => Ok(ProviderId::Perplexity),
            other => Err(format!("unsupported provider: {}", other)),
        }
    }
}

/**
 * \brief 请求与响应的报文形态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiShape {
    /** \brief OpenAI 兼容的 chat/completions。 */
    OpenAiCompatible,
    /** \brief Gemini 原生 generateContent（历史 + 单轮发送）。 */
    GeminiNative,
}

/**
 * \brief 单个模型服务的静态描述。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub display_name: &'static str,
    /** \brief `None` 表示使用客户端默认地址（仅 OpenAI）。 */
    pub base_endpoint: Option<String>,
    pub default_model: &'static str,
    pub available_models: Vec<&'static str>,
    pub api_shape: ApiShape,
}

pub const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";

impl ProviderDescriptor {
    /** \brief 实际请求使用的基地址。 */
    pub fn endpoint(&self) -> &str {
        self.base_endpoint.as_deref().unwrap_or(OPENAI_DEFAULT_BASE)
    }

    /** \brief 若调用方未指定模型则回落到默认模型。 */
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.trim().is_empty() {
            self.default_model
        } else {
            requested
        }
    }
}

fn builtin(id: ProviderId) -> ProviderDescriptor {
    match id {
        ProviderId::OpenAi => ProviderDescriptor {
            id,
            display_name: "OpenAI",
            base_endpoint: None,
            default_model: "gpt-4o-mini",
            available_models: vec!["gpt-4o-mini", "gpt-4o", "o3-mini"],
            api_shape: ApiShape::OpenAiCompatible,
        },
        ProviderId::Gemini => ProviderDescriptor {
            id,
            display_name: "Gemini",
            base_endpoint: Some("https://generativelanguage.googleapis.com/v1beta".to_string()),
            default_model: "gemini-1.5-flash",
            available_models: vec!["gemini-1.5-flash", "gemini-1.5-pro"],
            api_shape: ApiShape::GeminiNative,
        },
        ProviderId::DeepSeek => ProviderDescriptor {
            id,
            display_name: "DeepSeek",
            base_endpoint: Some("https://api.deepseek.com/v1".to_string()),
            default_model: "deepseek-chat",
            available_models: vec!["deepseek-chat", "deepseek-reasoner"],
            api_shape: ApiShape::OpenAiCompatible,
        },
        ProviderId::Claude => ProviderDescriptor {
            id,
            display_name: "Claude",
            base_endpoint: Some("https://api.anthropic.com/v1".to_string()),
            default_model: "claude-3-5-haiku-latest",
            available_models: vec!["claude-3-5-haiku-latest", "claude-3-5-sonnet-latest"],
            api_shape: ApiShape::OpenAiCompatible,
        },
        ProviderId::Perplexity => ProviderDescriptor {
            id,
            display_name: "Perplexity",
            base_endpoint: Some("https://api.perplexity.ai".to_string()),
            default_model: "sonar",
            available_models: vec!["sonar", "sonar-pro"],
            api_shape: ApiShape::OpenAiCompatible,
        },
    }
}

/**
 * \brief 进程级只读服务目录，启动时构造一次。
 */
#[derive(Debug, Clone)]
pub struct Registry {
    providers: Vec<ProviderDescriptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            providers: ProviderId::ALL.iter().map(|id| builtin(*id)).collect(),
        }
    }
}

impl Registry {
    /**
     * \brief 应用基地址覆盖（来自配置），未覆盖者保持内置值。
     */
    pub fn with_overrides(overrides: &HashMap<ProviderId, String>) -> Self {
        let mut registry = Self::default();
        for descriptor in registry.providers.iter_mut() {
            if let Some(base) = overrides.get(&descriptor.id) {
                descriptor.base_endpoint = Some(base.trim_end_matches('/').to_string());
            }
        }
        registry
    }

    pub fn get(&self, id: ProviderId) -> &ProviderDescriptor {
        // providers 按 ProviderId::ALL 顺序构造
        &self.providers[id as usize]
    }

    pub fn all(&self) -> &[ProviderDescriptor] {
        &self.providers
    }
}
