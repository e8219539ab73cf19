use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    error::{GatewayError, VaultError},
    llm::ClientFactory,
    models::ChatMessage,
    registry::{ProviderId, Registry},
    telemetry,
    vault::{ApiKey, StorageMode, Vault},
};

/** \brief 单次补全的输出上限。 */
pub const MAX_OUTPUT_TOKENS: u32 = 2048;

/** \brief 聊天记录中展示的统一兜底回复。 */
pub const CHAT_FALLBACK: &str = "Sorry I am busy at the moment, please try again later!";

/** \brief 未配置密钥时的提示。 */
pub const MISSING_KEY_HINT: &str = "Set your API key in settings first.";

/**
 * \brief 一次补全请求。
 */
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub owner: String,
    pub provider: ProviderId,
    /** \brief 为空时依次回落到用户默认模型、服务默认模型。 */
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /** \brief 调用方直接提供的密钥（本地模式），优先于凭据库。 */
    pub supplied_key: Option<String>,
    pub mode: StorageMode,
}

/**
 * \brief 模型网关：取密钥、建客户端、发起一次非流式调用并规整回复。
 */
pub struct Gateway {
    registry: Registry,
    vault: Arc<Vault>,
    factory: Arc<dyn ClientFactory>,
}

impl Gateway {
    pub fn new(registry: Registry, vault: Arc<Vault>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            registry,
            vault,
            factory,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /**
     * \brief 发起补全，错误按类型返回。
     * \details 密钥缺失时在构造客户端前即返回 MissingCredential，不产生任何网络请求。
     */
    pub async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let key = self.resolve_key(req)?;
        let model = self.resolve_model(req)?;
        let descriptor = self.registry.get(req.provider);
        let client = self.factory.build(descriptor, key);

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            res = client.complete(&req.messages, &model, MAX_OUTPUT_TOKENS) => res?,
        };
        if reply.trim().is_empty() {
            return Err(GatewayError::EmptyReply(req.provider));
        }
        Ok(reply)
    }

    /**
     * \brief 聊天界面使用：任何失败都记录后转换为兜底文本，绝不外露原始错误。
     */
    pub async fn reply(&self, req: &CompletionRequest, cancel: &CancellationToken) -> ChatReply {
        match self.complete(req, cancel).await {
            Ok(text) => ChatReply { text, ok: true },
            Err(err) => {
                telemetry::log_error(
                    "gateway.complete",
                    &format!(
                        "provider={} owner={} code={} status={} detail={}",
                        req.provider,
                        req.owner,
                        err.code(),
                        err.status().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                        err
                    ),
                );
                let text = match err {
                    GatewayError::MissingCredential(_) => MISSING_KEY_HINT,
                    _ => CHAT_FALLBACK,
                };
                ChatReply {
                    text: text.to_string(),
                    ok: false,
                }
            }
        }
    }

    fn resolve_key(&self, req: &CompletionRequest) -> Result<ApiKey, GatewayError> {
        if let Some(key) = req
            .supplied_key
            .as_deref()
            .map(ApiKey::new)
            .filter(|k| !k.is_blank())
        {
            return Ok(key);
        }
        let lookup = self
            .vault
            .get(&req.owner, req.provider, req.mode, None)
            .map_err(|err| match err {
                VaultError::NotConfigured(p) => GatewayError::MissingCredential(p),
                other => GatewayError::Vault(other),
            })?;
        lookup
            .secret
            .ok_or(GatewayError::MissingCredential(req.provider))
    }

    fn resolve_model(&self, req: &CompletionRequest) -> Result<String, GatewayError> {
        let requested = if req.model.trim().is_empty() {
            self.vault
                .default_model(&req.owner, req.provider)?
                .unwrap_or_default()
        } else {
            req.model.clone()
        };
        let descriptor = self.registry.get(req.provider);
        Ok(descriptor.resolve_model(&requested).to_string())
    }
}

/**
 * \brief 面向聊天界面的回复。
 */
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChatReply {
    pub text: String,
    pub ok: bool,
}
