use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("config error: {0}")]
    Config(String),
    #[error("image error: {0}")]
    Resolution(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BoxError {
    pub fn details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            Self::ProcessDetailed { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Error code of a classified runtime failure, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.details().map(|details| details.error_code.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}
