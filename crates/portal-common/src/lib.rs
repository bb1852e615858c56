pub mod errors;
pub mod id;

pub use errors::{ConfigError, PortalError};
pub use id::{new_correlation_id, new_id, ClientId};

pub type Result<T> = std::result::Result<T, PortalError>;
