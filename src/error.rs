use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormcalcError {
    #[error("Security violation: {0}")]
    SecurityViolation(String),
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Evaluation timed out after {budget:?}")]
    Timeout { budget: Duration },
    #[error("Circular dependency: {0}")]
    CircularDependency(String),
    #[error("Invalid field name: {0}")]
    InvalidField(String),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FormcalcError>;

// Helper conversions
impl From<config::ConfigError> for FormcalcError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
