// Shared plumbing used by both the runtime core and the HTTP boundary.

pub mod error;
pub mod sql;

pub use error::ApiError;
pub use sql::Record;
