//! Rewrites an Android package so it trusts user-installed CA certificates,
//! then realigns and re-signs it with a caller-supplied key.

pub mod android_sdk;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keystore;
pub mod manifest;
pub mod pipeline;
pub mod runner;
pub mod workspace;

pub use android_sdk::{Tool, ToolOverrides, Toolchain};
pub use config::{AppDirs, ConfigStore, RunConfig};
pub use credentials::{CredentialSource, CredentialStore, CredentialTuple, EffectiveCredential};
pub use error::{Error, Result, Stage, ToolFailure};
pub use keystore::{AliasReport, AliasResolver, Notice};
pub use pipeline::{Outcome, Pipeline, PipelineRequest, SigningCredential};
pub use runner::{CancelToken, FnProgress, ProgressSink, RunController, RunHandle};
