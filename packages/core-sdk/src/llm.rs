use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{
    error::GatewayError,
    models::{ChatMessage, ContentPart, MessageContent, Role},
    registry::{ApiShape, ProviderDescriptor, ProviderId},
    vault::ApiKey,
};

/**
 * \brief 统一的补全能力：输入消息序列，输出回复文本。
 */
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> ProviderId;

    /**
     * \brief 非流式调用，返回首个候选的文本（可能为空，由网关判定）。
     */
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError>;
}

/**
 * \brief 按服务描述与密钥构造客户端。
 */
pub trait ClientFactory: Send + Sync {
    fn build(&self, descriptor: &ProviderDescriptor, api_key: ApiKey) -> Box<dyn ProviderClient>;
}

/**
 * \brief 默认工厂：共享一个 reqwest 连接池，超时来自配置。
 */
#[derive(Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, descriptor: &ProviderDescriptor, api_key: ApiKey) -> Box<dyn ProviderClient> {
        match descriptor.api_shape {
            ApiShape::OpenAiCompatible => Box::new(OpenAiCompatibleClient {
                http: self.http.clone(),
                provider: descriptor.id,
                api_base: descriptor.endpoint().to_string(),
                api_key,
            }),
            ApiShape::GeminiNative => Box::new(GeminiClient {
                http: self.http.clone(),
                api_base: descriptor.endpoint().to_string(),
                api_key,
            }),
        }
    }
}

/**
 * \brief OpenAI 兼容客户端，由基地址区分具体服务。
 */
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    provider: ProviderId,
    api_base: String,
    api_key: ApiKey,
}

impl OpenAiCompatibleClient {
    pub fn new(provider: ProviderId, api_base: &str, api_key: ApiKey) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
            api_base: api_base.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let body = json!({
            "model": model,
            "messages": openai_messages(messages),
            "max_tokens": max_tokens,
            "stream": false
        });

        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key.expose()))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(self.provider, e))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Http {
                provider: self.provider,
                status: resp.status().as_u16(),
            });
        }
        let v: Value = resp.json().await.map_err(|e| transport(self.provider, e))?;
        Ok(extract_openai_content(&v))
    }
}

/**
 * \brief Gemini 原生客户端：system_instruction + 历史 + 单轮发送。
 */
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: ApiKey,
}

impl GeminiClient {
    pub fn new(api_base: &str, api_key: ApiKey) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let base = normalize_gemini_base(&self.api_base);
        let url = format!("{}/models/{}:generateContent", base, model);
        let (system_prompt, contents) = gemini_payload(messages);

        let mut body = json!({
            "contents": contents,
            "generationConfig": { "maxOutputTokens": max_tokens },
        });
        if let Some(sys) = system_prompt {
            body["system_instruction"] = json!({
                "parts": [{"text": sys}]
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(self.api_key.expose()).map_err(|_| {
            GatewayError::Transport {
                provider: ProviderId::Gemini,
                message: "api key contains invalid header characters".to_string(),
            }
        })?;
        headers.insert("x-goog-api-key", key);

        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(ProviderId::Gemini, e))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Http {
                provider: ProviderId::Gemini,
                status: resp.status().as_u16(),
            });
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| transport(ProviderId::Gemini, e))?;
        Ok(extract_gemini_content(&v))
    }
}

fn transport(provider: ProviderId, err: reqwest::Error) -> GatewayError {
    GatewayError::Transport {
        provider,
        message: err.without_url().to_string(),
    }
}

fn openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => json!({
                "role": m.role.as_str(),
                "content": text,
            }),
            MessageContent::Parts(parts) => json!({
                "role": m.role.as_str(),
                "content": parts.iter().map(|p| match p {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image { image } => json!({
                        "type": "image_url",
                        "image_url": {"url": image.data_url()}
                    }),
                }).collect::<Vec<_>>(),
            }),
        })
        .collect()
}

/**
 * \brief 转换为 Gemini 报文；相邻同角色消息合并为一轮，上下文段与提问因此成为同一轮发送。
 */
fn gemini_payload(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => {
                system_parts.push(msg.content.text());
                continue;
            }
            Role::Assistant => "model",
            Role::User => "user",
        };
        let parts = gemini_parts(&msg.content);
        let same_role = contents.last().map(|l| l["role"] == role).unwrap_or(false);
        if same_role {
            if let Some(existing) = contents.last_mut().and_then(|l| l["parts"].as_array_mut()) {
                existing.extend(parts);
            }
        } else {
            contents.push(json!({ "role": role, "parts": parts }));
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, contents)
}

fn gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::Image { image } => json!({
                    "inline_data": {"mime_type": image.mime_type, "data": image.data}
                }),
            })
            .collect(),
    }
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_gemini_content(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InlineImage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn convo() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "ctx".to_string(),
                    },
                    ContentPart::Image {
                        image: InlineImage::from_bytes("image/png", b"img"),
                    },
                ]),
            },
            ChatMessage::user("solve this"),
        ]
    }

    #[test]
    fn test_gemini_payload_merges_context_into_final_turn() {
        let (sys, contents) = gemini_payload(&convo());
        assert_eq!(sys.as_deref(), Some("sys"));
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        let last = contents[2]["parts"].as_array().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0]["text"], "ctx");
        assert_eq!(last[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(last[2]["text"], "solve this");
    }

    #[test]
    fn test_openai_messages_keep_multipart_shape() {
        let wire = openai_messages(&convo());
        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(wire[3]["content"][0]["type"], "text");
        assert_eq!(wire[3]["content"][1]["type"], "image_url");
        assert!(wire[3]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_extractors_tolerate_missing_fields() {
        assert_eq!(extract_openai_content(&json!({})), "");
        assert_eq!(
            extract_openai_content(&json!({"choices": [{"message": {"content": null}}]})),
            ""
        );
        assert_eq!(extract_gemini_content(&json!({"candidates": []})), "");
        assert_eq!(
            extract_gemini_content(&json!({
                "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]
            })),
            "ab"
        );
    }

    #[test]
    fn test_normalize_gemini_base() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(normalize_gemini_base("http://h/v1beta"), "http://h/v1beta");
    }

    #[tokio::test]
    async fn test_openai_compatible_client_posts_bearer_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "deepseek-chat", "max_tokens": 2048})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "use a hash map"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::new(
            ProviderId::DeepSeek,
            &format!("{}/v1", server.uri()),
            ApiKey::new("sk-test"),
        );
        let reply = client
            .complete(&[ChatMessage::user("hi")], "deepseek-chat", 2048)
            .await
            .expect("reply");
        assert_eq!(reply, "use a hash map");
    }

    #[tokio::test]
    async fn test_openai_compatible_client_maps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key sk-test"))
            .mount(&server)
            .await;

        let client =
            OpenAiCompatibleClient::new(ProviderId::OpenAi, &server.uri(), ApiKey::new("sk-test"));
        let err = client
            .complete(&[ChatMessage::user("hi")], "gpt-4o-mini", 2048)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(!err.to_string().contains("sk-test"));
    }

    #[tokio::test]
    async fn test_gemini_client_uses_native_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .and(body_partial_json(json!({
                "generationConfig": {"maxOutputTokens": 2048},
                "system_instruction": {"parts": [{"text": "sys"}]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "try two pointers"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&server.uri(), ApiKey::new("g-key"));
        let reply = client
            .complete(&convo(), "gemini-1.5-flash", 2048)
            .await
            .expect("reply");
        assert_eq!(reply, "try two pointers");
    }

    #[tokio::test]
    async fn test_factory_picks_client_by_shape() {
        let factory = HttpClientFactory::new(Duration::from_secs(5)).expect("factory");
        let registry = crate::registry::Registry::default();
        for descriptor in registry.all() {
            let client = factory.build(descriptor, ApiKey::new("k"));
            assert_eq!(client.provider(), descriptor.id);
        }
    }
}
