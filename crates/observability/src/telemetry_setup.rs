use std::sync::Arc;

use anyhow::{Context, Result};
use edgefleet_core::config::{ConfigValidator, LogFileConfig, LogFormat, LoggingConfig};
use edgefleet_core::fs::{make_sure_parent, MODE_DIR_SHARED};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::log_rotation::{RollingFile, RollingFileConfig};

/// 让 `tracing_subscriber::fmt` 通过滚动日志文件输出
#[derive(Debug, Clone)]
pub struct RollingMakeWriter(Arc<RollingFile>);

impl RollingMakeWriter {
    pub fn new(file: Arc<RollingFile>) -> Self {
        Self(file)
    }

    pub fn file(&self) -> &Arc<RollingFile> {
        &self.0
    }
}

impl<'a> MakeWriter<'a> for RollingMakeWriter {
    type Writer = &'a RollingFile;

    fn make_writer(&'a self) -> Self::Writer {
        &self.0
    }
}

/// 根据文件配置创建滚动日志输出
pub fn open_rolling_file(config: &LogFileConfig) -> Result<Arc<RollingFile>> {
    config.validate().context("日志文件配置无效")?;
    let rolling = RollingFileConfig::from(config);
    make_sure_parent(&rolling.file_path(), MODE_DIR_SHARED)
        .with_context(|| format!("创建日志目录失败: {}", rolling.file_path().display()))?;
    Ok(Arc::new(RollingFile::new(rolling)))
}

/// 初始化全局日志订阅器
///
/// 配置了 `logging.file` 时写入滚动日志文件并返回其句柄，否则写到标准输出。
/// `RUST_LOG` 环境变量优先于配置中的级别。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<Arc<RollingFile>>> {
    config.validate().context("日志配置无效")?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let rolling = config.file.as_ref().map(open_rolling_file).transpose()?;
    let writer = match &rolling {
        Some(file) => BoxMakeWriter::new(RollingMakeWriter::new(file.clone())),
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let ansi = rolling.is_none();

    let registry = tracing_subscriber::registry().with(env_filter);
    let initialized = match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(writer);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(writer);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(writer);
            registry.with(fmt_layer).try_init()
        }
    };
    initialized.map_err(|e| anyhow::anyhow!("初始化日志订阅器失败: {e}"))?;

    info!(
        logging.format = ?config.format,
        logging.level = %config.level,
        logging.file = ?rolling.as_ref().map(|f| f.path()),
        "日志系统初始化完成"
    );
    Ok(rolling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_make_writer_writes_through_rolling_file() {
        let dir = TempDir::new().unwrap();
        let config = LogFileConfig {
            file_name: dir.path().join("nested").join("app.log").display().to_string(),
            save_time_days: 0,
            save_volume: 0,
            compress: false,
            ..Default::default()
        };
        let file = open_rolling_file(&config).unwrap();
        let make_writer = RollingMakeWriter::new(file.clone());

        make_writer.make_writer().write_all(b"hello\n").unwrap();
        make_writer.make_writer().write_all(b"world\n").unwrap();
        file.flush().unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "hello\nworld\n");
    }

    #[test]
    fn test_open_rolling_file_rejects_invalid_config() {
        let config = LogFileConfig {
            save_volume: 99,
            ..Default::default()
        };
        assert!(open_rolling_file(&config).is_err());
    }
}
