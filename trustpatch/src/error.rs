use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// One discrete step of the transformation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Unpack,
    PatchNetworkConfig,
    PatchDebuggable,
    Repack,
    Align,
    Sign,
    Verify,
    Publish,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Unpack => "unpack",
            Stage::PatchNetworkConfig => "patch network-security-config",
            Stage::PatchDebuggable => "patch debuggable",
            Stage::Repack => "repack",
            Stage::Align => "align",
            Stage::Sign => "sign",
            Stage::Verify => "verify",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Exit status and diagnostic text of an external tool that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub code: Option<i32>,
    pub diagnostic: String,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code)?,
            None => write!(f, "terminated by signal")?,
        }
        let diagnostic = self.diagnostic.trim();
        if !diagnostic.is_empty() {
            write!(f, ": {}", diagnostic)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Input Error: {0}")]
    Input(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Workspace Error: {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unpack Error: apktool failed ({0})")]
    Unpack(ToolFailure),

    #[error("Manifest Error: {0}")]
    Manifest(String),

    #[error("Repack Error: apktool failed ({0})")]
    Repack(ToolFailure),

    #[error("Align Error: zipalign failed ({0})")]
    Align(ToolFailure),

    #[error("Sign Error: apksigner rejected the keystore, alias or passwords ({0})")]
    Sign(ToolFailure),

    #[error("Verify Error: signed package failed verification ({0})")]
    Verify(ToolFailure),

    #[error("Cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("Failed to execute {program}: {source}")]
    ToolLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("XML Error in {path}: {message}")]
    Xml { path: PathBuf, message: String },

    #[error("I/O Error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML Error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("A run is already in progress")]
    Busy,

    #[error("Worker Error: {0}")]
    Worker(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// The pipeline stage a failure belongs to, when it belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Workspace { .. } => Some(Stage::Prepare),
            Error::Unpack(_) => Some(Stage::Unpack),
            Error::Repack(_) => Some(Stage::Repack),
            Error::Align(_) => Some(Stage::Align),
            Error::Sign(_) => Some(Stage::Sign),
            Error::Verify(_) => Some(Stage::Verify),
            Error::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }

    /// Raw diagnostic text of the external tool behind this failure.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Error::Unpack(f)
            | Error::Repack(f)
            | Error::Align(f)
            | Error::Sign(f)
            | Error::Verify(f) => Some(&f.diagnostic),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
