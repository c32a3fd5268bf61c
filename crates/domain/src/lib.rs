pub mod bridge;
pub mod error;
pub mod jobs;
pub mod message;
pub mod ports;
pub mod threading;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
