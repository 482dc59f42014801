use crate::{FleetError, FleetResult};

/// 配置校验接口
pub trait ConfigValidator {
    fn validate(&self) -> FleetResult<()>;
}

/// 通用校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> FleetResult<()> {
        if value.trim().is_empty() {
            return Err(FleetError::Validation(format!("{field_name} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_range<T>(value: T, min: T, max: T, field_name: &str) -> FleetResult<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if value < min || value > max {
            return Err(FleetError::Validation(format!(
                "{field_name} 必须在 {min} 到 {max} 之间, 当前值: {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> FleetResult<()> {
        Self::validate_range(timeout_seconds, 1, 3600, field_name)
    }

    pub fn validate_count(count: usize, field_name: &str) -> FleetResult<()> {
        Self::validate_range(count, 1, 1_000_000, field_name)
    }
}
