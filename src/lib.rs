pub mod app;
pub mod collaborators;
pub mod http;
pub mod shutdown;
