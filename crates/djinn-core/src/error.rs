use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {port} is claimed by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
