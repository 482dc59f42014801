pub mod sqlite_cert_status_repository;
pub mod sqlite_task_repository;

pub use sqlite_cert_status_repository::SqliteCertStatusRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
