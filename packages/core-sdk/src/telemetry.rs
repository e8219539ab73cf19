use std::{fs::OpenOptions, io::Write, path::PathBuf, sync::RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone)]
struct Sink {
    enabled: bool,
    dir: PathBuf,
}

static SINK: Lazy<RwLock<Sink>> = Lazy::new(|| {
    RwLock::new(Sink {
        enabled: false,
        dir: PathBuf::from("logs"),
    })
});

const LOG_FILE: &str = "codepal.log";

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = SINK.write() {
        guard.enabled = enabled;
    }
}

/**
 * \brief 设置文件落盘目录。
 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = SINK.write() {
        guard.dir = dir.into();
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    SINK.read().map(|g| g.enabled).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(target: "codepal", category = category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(target: "codepal", category = category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let log_dir = SINK
        .read()
        .map(|g| g.dir.clone())
        .unwrap_or_else(|_| PathBuf::from("logs"));
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 全局开关，其他测试可能并发写入，仅校验本测试的分类
    #[test]
    fn test_file_sink_follows_switch() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_log_dir(dir.path());

        set_enabled(false);
        log_event("test.sink", "dropped");
        assert!(!dir.path().join(LOG_FILE).exists());

        set_enabled(true);
        log_event("test.sink", "kept");
        log_error("test.sink", "failed provider=GEMINI status=401");
        set_enabled(false);

        let content = std::fs::read_to_string(dir.path().join(LOG_FILE)).expect("read log");
        let lines: Vec<_> = content
            .lines()
            .filter(|l| l.contains("test.sink"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] test.sink - kept"));
        assert!(lines[1].contains("[ERROR] test.sink - failed provider=GEMINI status=401"));
    }
}
