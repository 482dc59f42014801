//! 边缘节点证书轮换协调

pub mod collaborators;
pub mod executor;
pub mod issuer;
pub mod payload;
pub mod updater;

pub use collaborators::{AlarmId, AlarmSink, Collaborators, NodeInventory, NodeNotifier, ResultReporter, TrustStoreNotifier};
pub use executor::{CertUpdateExecutorFactory, CERT_UPDATE_COMMAND};
pub use issuer::ServiceCertIssuer;
pub use payload::{CertUpdatePayload, NodeDelta, NodeResult};
pub use updater::{CertUpdater, RotationSummary, StartOutcome, StopReason, UpdateSettings};
