// HTTP boundary: submission, cancel, retrieval, and streaming.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
