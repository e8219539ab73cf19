use std::{fmt, sync::Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    codec::SecretCodec,
    db::{self, CredentialRow},
    error::VaultError,
    registry::ProviderId,
    telemetry,
};

/**
 * \brief 密钥保存位置。数据库中以 UNSET/LOCAL/CLOUD 存储。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageMode {
    #[default]
    Unset,
    /** \brief 仅客户端持有，服务端不保存。 */
    #[serde(alias = "LOCAL")]
    Ephemeral,
    /** \brief 加密后保存在服务端。 */
    #[serde(alias = "CLOUD")]
    Persisted,
}

impl StorageMode {
    pub fn as_db(&self) -> &'static str {
        match self {
            StorageMode::Unset => "UNSET",
            StorageMode::Ephemeral => "LOCAL",
            StorageMode::Persisted => "CLOUD",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "LOCAL" => StorageMode::Ephemeral,
            "CLOUD" => StorageMode::Persisted,
            _ => StorageMode::Unset,
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unset" => Ok(StorageMode::Unset),
            "ephemeral" | "local" => Ok(StorageMode::Ephemeral),
            "persisted" | "cloud" => Ok(StorageMode::Persisted),
            other => Err(format!("unknown storage mode: {}", other)),
        }
    }
}

/**
 * \brief 明文 API Key，Debug/Display 均脱敏。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /** \brief 仅在构造上游请求时取出明文。 */
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/**
 * \brief 凭据查询结果。
 */
#[derive(Debug, Clone)]
pub struct CredentialLookup {
    pub secret: Option<ApiKey>,
    pub mode: StorageMode,
}

impl CredentialLookup {
    pub fn present(&self) -> bool {
        self.secret.is_some()
    }

    fn absent(mode: StorageMode) -> Self {
        Self { secret: None, mode }
    }
}

/**
 * \brief 保存结果；本地模式下将密钥交还调用方自行保存。
 */
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Persisted,
    ReturnedToCaller(ApiKey),
}

/**
 * \brief 持久化凭据存储的抽象，便于测试注入替身。
 * \details 每个写操作必须是单条原子语句，保证并发读取不会观察到半迁移状态。
 */
pub trait CredentialStore: Send + Sync {
    fn fetch(&self, owner: &str, provider: ProviderId) -> Result<Option<CredentialRow>, VaultError>;
    fn upsert_secret(
        &self,
        owner: &str,
        provider: ProviderId,
        ciphertext: &str,
    ) -> Result<(), VaultError>;
    fn delete(&self, owner: &str, provider: ProviderId) -> Result<bool, VaultError>;
    fn set_default_model(
        &self,
        owner: &str,
        provider: ProviderId,
        model: &str,
    ) -> Result<(), VaultError>;
}

/**
 * \brief 基于 SQLite 的凭据存储。
 */
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /** \brief 接管已迁移的连接。 */
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = db::open_db(path)?;
        db::migrate(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::migrate(&conn)?;
        Ok(Self::new(conn))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, VaultError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| VaultError::Backend("credential store lock poisoned".to_string()))?;
        f(&guard).map_err(VaultError::from)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn fetch(&self, owner: &str, provider: ProviderId) -> Result<Option<CredentialRow>, VaultError> {
        self.with_conn(|c| db::fetch_credential(c, owner, provider))
    }

    fn upsert_secret(
        &self,
        owner: &str,
        provider: ProviderId,
        ciphertext: &str,
    ) -> Result<(), VaultError> {
        self.with_conn(|c| db::upsert_credential_secret(c, owner, provider, ciphertext))
    }

    fn delete(&self, owner: &str, provider: ProviderId) -> Result<bool, VaultError> {
        self.with_conn(|c| db::delete_credential(c, owner, provider))
    }

    fn set_default_model(
        &self,
        owner: &str,
        provider: ProviderId,
        model: &str,
    ) -> Result<(), VaultError> {
        self.with_conn(|c| db::upsert_default_model(c, owner, provider, model))
    }
}

/**
 * \brief 凭据库：决定每个用户、每个服务的密钥保存位置。
 * \details 密文只在本边界内解密，不会以任何形式返回给调用方。
 */
pub struct Vault {
    codec: SecretCodec,
    store: Box<dyn CredentialStore>,
}

impl Vault {
    pub fn new(codec: SecretCodec, store: Box<dyn CredentialStore>) -> Self {
        Self { codec, store }
    }

    /**
     * \brief 读取密钥，不修改任何状态。
     * \param mode 调用方当前选择的保存方式
     * \param held 调用方在本地持有的密钥（本地模式）
     */
    pub fn get(
        &self,
        owner: &str,
        provider: ProviderId,
        mode: StorageMode,
        held: Option<&str>,
    ) -> Result<CredentialLookup, VaultError> {
        let held = held.map(ApiKey::new).filter(|k| !k.is_blank());
        match mode {
            StorageMode::Ephemeral => Ok(CredentialLookup {
                secret: held,
                mode: StorageMode::Ephemeral,
            }),
            StorageMode::Persisted => match self.persisted_secret(owner, provider)? {
                Some(secret) => Ok(CredentialLookup {
                    secret: Some(secret),
                    mode: StorageMode::Persisted,
                }),
                None => Err(VaultError::NotConfigured(provider)),
            },
            StorageMode::Unset => {
                if let Some(secret) = self.persisted_secret(owner, provider)? {
                    return Ok(CredentialLookup {
                        secret: Some(secret),
                        mode: StorageMode::Persisted,
                    });
                }
                Ok(match held {
                    Some(secret) => CredentialLookup {
                        secret: Some(secret),
                        mode: StorageMode::Ephemeral,
                    },
                    None => CredentialLookup::absent(StorageMode::Unset),
                })
            }
        }
    }

    fn persisted_secret(
        &self,
        owner: &str,
        provider: ProviderId,
    ) -> Result<Option<ApiKey>, VaultError> {
        let row = match self.store.fetch(owner, provider)? {
            Some(row) if row.store_pref == StorageMode::Persisted && !row.api_key.is_empty() => {
                row
            }
            _ => return Ok(None),
        };
        match self.codec.decrypt(&row.api_key) {
            Ok(plain) => Ok(Some(ApiKey::new(plain))),
            Err(err) => {
                telemetry::log_error(
                    "security.vault",
                    &format!(
                        "stored credential failed to decrypt provider={} owner={} reason={}",
                        provider, owner, err
                    ),
                );
                Err(VaultError::Decryption(err))
            }
        }
    }

    /**
     * \brief 保存密钥；唯一会修改持久化状态的操作，重复调用结果一致。
     * \details 云端模式：加密后单条 upsert；本地模式：单条 delete 清除云端副本，并把密钥交还调用方。
     */
    pub fn save(
        &self,
        owner: &str,
        provider: ProviderId,
        secret: &str,
        mode: StorageMode,
    ) -> Result<SaveOutcome, VaultError> {
        match mode {
            StorageMode::Persisted => {
                let token = self.codec.encrypt(secret).map_err(VaultError::Encryption)?;
                self.store.upsert_secret(owner, provider, &token)?;
                telemetry::log_event(
                    "vault.save",
                    &format!("provider={} owner={} mode=CLOUD", provider, owner),
                );
                Ok(SaveOutcome::Persisted)
            }
            StorageMode::Ephemeral => {
                let purged = self.store.delete(owner, provider)?;
                telemetry::log_event(
                    "vault.save",
                    &format!(
                        "provider={} owner={} mode=LOCAL purged={}",
                        provider, owner, purged
                    ),
                );
                Ok(SaveOutcome::ReturnedToCaller(ApiKey::new(secret)))
            }
            StorageMode::Unset => Err(VaultError::InvalidMode),
        }
    }

    /**
     * \brief 读取该服务当前记录的保存方式（设置页展示用）。
     */
    pub fn stored_mode(&self, owner: &str, provider: ProviderId) -> Result<StorageMode, VaultError> {
        Ok(match self.store.fetch(owner, provider)? {
            Some(row) if !row.api_key.is_empty() => row.store_pref,
            _ => StorageMode::Unset,
        })
    }

    pub fn default_model(
        &self,
        owner: &str,
        provider: ProviderId,
    ) -> Result<Option<String>, VaultError> {
        Ok(self
            .store
            .fetch(owner, provider)?
            .and_then(|row| row.default_model)
            .filter(|m| !m.is_empty()))
    }

    pub fn set_default_model(
        &self,
        owner: &str,
        provider: ProviderId,
        model: &str,
    ) -> Result<(), VaultError> {
        self.store.set_default_model(owner, provider, model)
    }
}
