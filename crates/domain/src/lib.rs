pub mod config;
pub mod errors;
pub mod hosts;

pub use config::{Config, StubZone};
pub use errors::DomainError;
pub use hosts::{HostEntry, Hostfile};
