use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GearError {
    #[error("invalid destination id: {0}")]
    InvalidDestinationId(String),

    #[error("invalid run level: {0}")]
    InvalidRunLevel(String),

    #[error("invalid container type: {0}")]
    InvalidContainerType(String),

    #[error("missing config file config.json in {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid gear option {key}: {message}")]
    InvalidOption { key: String, message: String },

    #[error("platform request failed: {0}")]
    ApiHttp(String),

    #[error("platform returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("BIDS export failed: {0}")]
    BidsExport(String),

    #[error("unusable BIDS dataset description: {0}")]
    DatasetDescription(String),

    #[error("bids-validator could not be run: {0}")]
    ValidatorRun(String),

    #[error("bids-validator output is malformed: {0}")]
    ValidatorOutput(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("command could not be started: {0}")]
    Execution(String),

    #[error("host introspection failed: {0}")]
    HostIntrospection(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Problems collected during a run instead of being returned early, so one
/// summary at the end can list all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
