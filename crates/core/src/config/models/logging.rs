use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{FleetError, FleetResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("不支持的日志格式: {s}, 可选值: json, pretty, compact")),
        }
    }
}

/// 滚动日志文件配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogFileConfig {
    pub file_name: String,
    /// 为空时备份文件与日志文件位于同一目录
    #[serde(default)]
    pub backup_dir: String,
    /// 单个日志文件大小上限（MB），0 或超出上限时使用默认值
    #[serde(default)]
    pub capacity_mb: u64,
    /// 备份保留天数，0 表示不按时间清理
    #[serde(default)]
    pub save_time_days: u32,
    /// 备份保留个数，0 表示不按数量清理
    #[serde(default)]
    pub save_volume: u32,
    #[serde(default)]
    pub local_time: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub disable_on_user_switch: bool,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            file_name: "logs/edgefleet.log".to_string(),
            backup_dir: String::new(),
            capacity_mb: 20,
            save_time_days: 7,
            save_volume: 30,
            local_time: false,
            compress: true,
            disable_on_user_switch: false,
        }
    }
}

impl ConfigValidator for LogFileConfig {
    fn validate(&self) -> FleetResult<()> {
        ValidationUtils::validate_not_empty(&self.file_name, "logging.file.file_name")?;
        if self.save_volume != 0 {
            ValidationUtils::validate_range(self.save_volume, 1, 30, "logging.file.save_volume")?;
        }
        if self.save_time_days != 0 {
            ValidationUtils::validate_range(self.save_time_days, 7, 700, "logging.file.save_time_days")?;
        }
        if std::path::Path::new(&self.file_name).file_name().is_none() {
            return Err(FleetError::Validation(format!(
                "日志文件路径无效: {}",
                self.file_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub include_location: bool,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
            file: None,
        }
    }
}

impl ConfigValidator for LoggingConfig {
    fn validate(&self) -> FleetResult<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(FleetError::Validation(format!(
                    "logging.level 无效: {other}"
                )))
            }
        }
        if let Some(file) = &self.file {
            file.validate()?;
        }
        Ok(())
    }
}
