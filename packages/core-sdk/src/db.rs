use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};

use crate::{registry::ProviderId, vault::StorageMode};

/**
 * \brief 凭据表中的一行（apiKey 为密文）。
 */
#[derive(Debug, Clone)]
pub struct CredentialRow {
    /** \brief 密文；空串表示未保存密钥。 */
    pub api_key: String,
    pub store_pref: StorageMode,
    pub default_model: Option<String>,
    pub updated_at: String,
}

/**
 * \brief 打开数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移：每个模型服务一张凭据表，按 userId 唯一。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| conn.execute_batch("PRAGMA journal_mode=WAL;"))?;
    for provider in ProviderId::ALL {
        let ddl = format!(
            r#"
        CREATE TABLE IF NOT EXISTS {table} (
            userId TEXT PRIMARY KEY,
            apiKey TEXT NOT NULL DEFAULT '',
            storePref TEXT NOT NULL DEFAULT 'UNSET',
            defaultModel TEXT,
            updatedAt TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
            table = provider.config_table()
        );
        retry_on_locked(|| conn.execute_batch(&ddl))?;
    }
    Ok(())
}

/**
 * \brief 读取凭据行。
 */
pub fn fetch_credential(
    conn: &Connection,
    user_id: &str,
    provider: ProviderId,
) -> rusqlite::Result<Option<CredentialRow>> {
    let sql = format!(
        "SELECT apiKey, storePref, defaultModel, updatedAt FROM {} WHERE userId=?1",
        provider.config_table()
    );
    conn.query_row(&sql, params![user_id], |row| {
        let pref: String = row.get(1)?;
        Ok(CredentialRow {
            api_key: row.get(0)?,
            store_pref: StorageMode::from_db(&pref),
            default_model: row.get(2)?,
            updated_at: row.get(3)?,
        })
    })
    .optional()
}

/**
 * \brief 单条语句写入密文并标记为云端保存，已有默认模型保持不变。
 */
pub fn upsert_credential_secret(
    conn: &Connection,
    user_id: &str,
    provider: ProviderId,
    ciphertext: &str,
) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO {} (userId, apiKey, storePref, updatedAt)
         VALUES (?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(userId) DO UPDATE SET
            apiKey=excluded.apiKey,
            storePref=excluded.storePref,
            updatedAt=excluded.updatedAt",
        provider.config_table()
    );
    retry_on_locked_raw(|| {
        conn.execute(
            &sql,
            params![user_id, ciphertext, StorageMode::Persisted.as_db()],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除整行（切换为本地保存时清除云端密文）。返回是否删除了记录。
 */
pub fn delete_credential(
    conn: &Connection,
    user_id: &str,
    provider: ProviderId,
) -> rusqlite::Result<bool> {
    let sql = format!("DELETE FROM {} WHERE userId=?1", provider.config_table());
    let rows = retry_on_locked_raw(|| conn.execute(&sql, params![user_id]))?;
    Ok(rows > 0)
}

/**
 * \brief 更新默认模型，不触碰密钥列。
 */
pub fn upsert_default_model(
    conn: &Connection,
    user_id: &str,
    provider: ProviderId,
    model: &str,
) -> rusqlite::Result<()> {
    let sql = format!(
        "INSERT INTO {} (userId, defaultModel, updatedAt)
         VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(userId) DO UPDATE SET
            defaultModel=excluded.defaultModel,
            updatedAt=excluded.updatedAt",
        provider.config_table()
    );
    retry_on_locked_raw(|| conn.execute(&sql, params![user_id, model]))?;
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    Ok(retry_on_locked_raw(action)?)
}

fn retry_on_locked_raw<T, F>(mut action: F) -> rusqlite::Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            other => return other,
        }
    }
}
