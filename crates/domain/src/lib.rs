pub mod cert_status;
pub mod pool;
pub mod repositories;
pub mod task;

pub use cert_status::*;
pub use edgefleet_core::{FleetError, FleetResult};
pub use pool::GoroutinePoolSpec;
pub use repositories::*;
pub use task::*;
