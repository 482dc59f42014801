pub mod http;
pub mod listener;

pub use http::{limit_middleware, with_limits, LimitHandler, TOO_MANY_REQUESTS_BODY};
pub use listener::{LimitListener, LimitedConn};
