use thiserror::Error;

use crate::registry::ProviderId;

/**
 * \brief 进程级配置错误，启动阶段即视为致命。
 */
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/**
 * \brief 加解密错误。信息中不得包含明文。
 */
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed: {0}")]
    Decryption(&'static str),
}

/**
 * \brief 凭据库错误。
 */
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no api key stored for {0}")]
    NotConfigured(ProviderId),
    #[error("storage mode must be chosen before saving a key")]
    InvalidMode,
    #[error("stored key could not be decrypted")]
    Decryption(#[source] CodecError),
    #[error("credential encryption failed")]
    Encryption(#[source] CodecError),
    #[error("credential store failed: {0}")]
    Backend(String),
}

impl VaultError {
    /** \brief 面向遥测的稳定错误码。 */
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::NotConfigured(_) => "missing_credential",
            VaultError::InvalidMode => "invalid_mode",
            VaultError::Decryption(_) => "decryption_error",
            VaultError::Encryption(_) => "encryption_error",
            VaultError::Backend(_) => "backend_error",
        }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        VaultError::Backend(err.to_string())
    }
}

/**
 * \brief 模型网关错误。
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no api key available for {0}")]
    MissingCredential(ProviderId),
    #[error("credential lookup failed")]
    Vault(#[from] VaultError),
    #[error("{provider} request failed with status {status}")]
    Http { provider: ProviderId, status: u16 },
    #[error("{provider} transport error: {message}")]
    Transport { provider: ProviderId, message: String },
    #[error("{0} returned an empty reply")]
    EmptyReply(ProviderId),
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /** \brief 面向遥测的稳定错误码。 */
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential(_) => "missing_credential",
            GatewayError::Vault(inner) => inner.code(),
            GatewayError::Http { .. } | GatewayError::Transport { .. } => "backend_error",
            GatewayError::EmptyReply(_) => "empty_reply",
            GatewayError::Cancelled => "cancelled",
        }
    }

    /** \brief 若错误来自 HTTP 状态码，返回该状态码。 */
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/**
 * \brief 代码执行后端错误。
 */
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution backend responded with status {status}")]
    TransportFailed { status: u16, body: String },
    #[error("execution backend unreachable: {0}")]
    Unreachable(String),
    #[error("execution backend returned an unreadable body: {0}")]
    Decode(String),
    #[error("submission cancelled")]
    Cancelled,
}

impl ExecutionError {
    /** \brief 面向遥测的稳定错误码。 */
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::TransportFailed { .. }
            | ExecutionError::Unreachable(_)
            | ExecutionError::Decode(_) => "backend_error",
            ExecutionError::Cancelled => "cancelled",
        }
    }

    /** \brief 展示给用户的简短说明，不含后端原始内容。 */
    pub fn user_message(&self) -> String {
        match self {
            ExecutionError::TransportFailed { status: 429, .. } => {
                "Daily submission limit reached. Try again later.".to_string()
            }
            ExecutionError::TransportFailed { status, .. } => {
                format!("Error in request to Judge0, Status: {}", status)
            }
            ExecutionError::Unreachable(_) | ExecutionError::Decode(_) => {
                "Unknown error occurred".to_string()
            }
            ExecutionError::Cancelled => "Submission cancelled".to_string(),
        }
    }
}
