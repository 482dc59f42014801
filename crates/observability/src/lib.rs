//! 日志输出：滚动日志文件与全局订阅器初始化

pub mod log_rotation;
pub mod telemetry_setup;

pub use log_rotation::{user_switched, BackupFile, RollingFile, RollingFileConfig};
pub use telemetry_setup::{init_logging, open_rolling_file, RollingMakeWriter};
