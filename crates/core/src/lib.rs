pub mod config;
pub mod context;
pub mod errors;
pub mod fs;
pub mod ids;
pub mod serde_helpers;

pub use config::AppConfig;
pub use context::RequestContext;
pub use errors::*;
pub use serde_helpers::JsonMap;
