//! 统一配置管理
//!
//! 配置按以下优先级合并（后者覆盖前者）：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件
//! 3. `EDGEFLEET_` 前缀的环境变量，层级之间使用 `__` 分隔，
//!    例如 `EDGEFLEET_SCHEDULER__MAX_ACTIVE_TASKS=200`
//!
//! 加载完成后会对每个配置段执行校验。

pub mod models;
pub mod validation;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use models::*;
pub use validation::{ConfigValidator, ValidationUtils};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/edgefleet.toml",
    "edgefleet.toml",
    "/etc/edgefleet/config.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub cert_update: CertUpdateConfig,
}

impl AppConfig {
    /// 加载配置，未指定路径时依次查找默认位置
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("EDGEFLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置校验失败")?;
        self.scheduler.validate().context("调度器配置校验失败")?;
        self.logging.validate().context("日志配置校验失败")?;
        self.http.validate().context("HTTP配置校验失败")?;
        self.certs.validate().context("证书配置校验失败")?;
        self.cert_update.validate().context("证书轮换配置校验失败")?;
        Ok(())
    }
}
