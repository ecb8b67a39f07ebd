use core::fmt;
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

use parser::ConfigError;

pub struct CleanError(pub Box<dyn Error>);

impl Debug for CleanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[31mERROR\x1b[0m: {}", self.0)
    }
}

impl Error for CleanError {}

impl From<ConfigError> for CleanError {
    fn from(e: ConfigError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<EngineError> for CleanError {
    fn from(e: EngineError) -> Self {
        CleanError(Box::new(e))
    }
}

#[derive(Debug)]
pub enum EngineError {
    PoisonedLock(&'static str),
    PoolExhausted,
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::PoisonedLock(what) => write!(f, "poisoned lock: {what}"),
            EngineError::PoolExhausted => write!(f, "session pool exhausted"),
        }
    }
}

impl Error for EngineError {}

impl From<std::io::Error> for CleanError {
    fn from(e: std::io::Error) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<std::net::AddrParseError> for CleanError {
    fn from(e: std::net::AddrParseError) -> Self {
        CleanError(Box::new(e))
    }
}

impl From<String> for CleanError {
    fn from(s: String) -> Self {
        CleanError(Box::new(ConfigError {
            message: s,
            loc: None,
            context: Vec::new(),
        }))
    }
}

impl From<&str> for CleanError {
    fn from(s: &str) -> Self {
        CleanError(Box::new(ConfigError {
            message: s.to_string(),
            loc: None,
            context: Vec::new(),
        }))
    }
}

pub type Result<T> = std::result::Result<T, CleanError>;
