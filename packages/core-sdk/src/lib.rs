pub mod codec;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod vault;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::error::{ExecutionError, GatewayError, VaultError};
    pub use crate::gateway::{CompletionRequest, Gateway};
    pub use crate::models::{ChatMessage, ChatSession, CodeContext, ProblemContext};
    pub use crate::registry::{ProviderId, Registry};
    pub use crate::server::AppState;
    pub use crate::vault::{StorageMode, Vault};
    pub use crate::{execution, orchestrator, server, telemetry};
}
