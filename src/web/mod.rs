pub mod error;
pub mod schema;
pub mod server;

pub use error::ApiError;
pub use server::{ApiServer, AppState};
