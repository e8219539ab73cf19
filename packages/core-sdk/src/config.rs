use std::{collections::HashMap, time::Duration};

use crate::{codec::SecretCodec, error::ConfigError, registry::ProviderId};

pub const DEFAULT_MEMORY_LIMIT_KB: u32 = 128_000;
pub const DEFAULT_TIME_LIMIT_SECS: f64 = 5.0;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/**
 * \brief 代码执行的默认资源限制。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub memory_limit_kb: u32,
    pub time_limit_seconds: f64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_limit_kb: DEFAULT_MEMORY_LIMIT_KB,
            time_limit_seconds: DEFAULT_TIME_LIMIT_SECS,
        }
    }
}

/**
 * \brief 进程级配置，启动时读取一次。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub codec: SecretCodec,
    pub execution_url: String,
    pub db_path: String,
    pub provider_base_urls: HashMap<ProviderId, String>,
    pub http_timeout: Duration,
    pub limits: ExecutionLimits,
    pub telemetry_enabled: bool,
    pub log_dir: String,
    pub ui_dir: Option<String>,
}

impl AppConfig {
    /**
     * \brief 从进程环境变量读取。缺少加密密钥或执行网关地址即为致命错误。
     */
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 通过任意查找函数构造，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let key_hex = get("CODEPAL_ENCRYPTION_KEY").ok_or(ConfigError::Missing("CODEPAL_ENCRYPTION_KEY"))?;
        let codec = SecretCodec::from_hex_key(&key_hex)?;

        let execution_url = get("CODEPAL_EXECUTION_URL")
            .ok_or(ConfigError::Missing("CODEPAL_EXECUTION_URL"))?
            .trim_end_matches('/')
            .to_string();

        let mut provider_base_urls = HashMap::new();
        for provider in ProviderId::ALL {
            if let Some(url) = get(&format!("CODEPAL_{}_BASE_URL", provider.as_str())) {
                provider_base_urls.insert(provider, url);
            }
        }

        let http_timeout = Duration::from_secs(parse_or(
            get("CODEPAL_HTTP_TIMEOUT_SECS"),
            "CODEPAL_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        )?);
        let limits = ExecutionLimits {
            memory_limit_kb: parse_or(
                get("CODEPAL_MEMORY_LIMIT_KB"),
                "CODEPAL_MEMORY_LIMIT_KB",
                DEFAULT_MEMORY_LIMIT_KB,
            )?,
            time_limit_seconds: parse_or(
                get("CODEPAL_TIME_LIMIT_SECS"),
                "CODEPAL_TIME_LIMIT_SECS",
                DEFAULT_TIME_LIMIT_SECS,
            )?,
        };

        Ok(Self {
            codec,
            execution_url,
            db_path: get("CODEPAL_DB_PATH").unwrap_or_else(|| "codepal.db".to_string()),
            provider_base_urls,
            http_timeout,
            limits,
            telemetry_enabled: get("CODEPAL_TELEMETRY")
                .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
                .unwrap_or(false),
            log_dir: get("CODEPAL_LOG_DIR").unwrap_or_else(|| "logs".to_string()),
            ui_dir: get("CODEPAL_UI_DIR"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}
