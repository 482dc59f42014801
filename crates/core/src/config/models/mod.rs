pub mod certs;
pub mod database;
pub mod http;
pub mod logging;
pub mod scheduler;

pub use certs::{CertUpdateConfig, EdgeNodeConfig, CertsConfig, ExpiryScanConfig, KmsSubConfig, RootSubjectConfig};
pub use database::DatabaseConfig;
pub use http::{HttpConfig, IpLimiterVersion, LimitHandlerConfig, ListenerConfig, DEFAULT_CACHE_SIZE};
pub use logging::{LogFileConfig, LogFormat, LoggingConfig};
pub use scheduler::{PoolConfig, SchedulerConfig};
