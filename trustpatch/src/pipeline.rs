//! The package transformation pipeline.
//!
//! validate → prepare → unpack → patch network config → patch debuggable →
//! repack → align → sign → verify → publish
//!
//! Each stage shells out and waits; cancellation is only observed between
//! stages, so a request made during unpack or sign takes effect once that
//! tool exits.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::android_sdk::{Tool, ToolOutput, Toolchain};
use crate::config::RunConfig;
use crate::credentials::CredentialTuple;
use crate::error::{Error, Result, Stage, ToolFailure};
use crate::manifest::{
    self, AndroidManifest, DebuggablePatch, NetworkSecurityConfig, TrustPatch,
};
use crate::runner::{CancelToken, ProgressSink};
use crate::workspace::{Release, Workspace, WorkspaceManager};

pub const ALIGNMENT: &str = "4";
pub const OUTPUT_SUFFIX: &str = "_Trust";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningCredential {
    pub keystore: PathBuf,
    pub keystore_password: String,
    pub key_alias: String,
    pub key_password: String,
}

impl SigningCredential {
    pub fn to_tuple(&self) -> CredentialTuple {
        CredentialTuple {
            cert_path: self.keystore.to_string_lossy().into_owned(),
            cert_password: self.keystore_password.clone(),
            key_alias: self.key_alias.clone(),
            key_password: self.key_password.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub package: PathBuf,
    pub credential: SigningCredential,
    /// Reuse a previous run's unpacked workspace when one exists.
    pub skip_decompile: bool,
}

/// Terminal result of one run.
#[derive(Debug)]
pub enum Outcome {
    Succeeded { artifact: PathBuf },
    Failed { stage: Option<Stage>, error: Error },
    Cancelled { stage: Stage },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }

    pub fn artifact(&self) -> Option<&Path> {
        match self {
            Outcome::Succeeded { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The `(ok, message)` pair reported to a result sink.
    pub fn as_pair(&self) -> (bool, String) {
        (self.is_success(), self.message())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded { artifact } => write!(f, "Completed: {}", artifact.display()),
            Outcome::Failed {
                stage: Some(stage),
                error,
            } => write!(f, "Failed during {}: {}", stage, error),
            Outcome::Failed { stage: None, error } => write!(f, "Failed: {}", error),
            Outcome::Cancelled { stage } => write!(f, "Cancelled before {}", stage),
        }
    }
}

struct StageFailure {
    stage: Stage,
    error: Error,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

fn tool_failure(output: &ToolOutput) -> ToolFailure {
    ToolFailure {
        code: output.code,
        diagnostic: output.diagnostic(),
    }
}

/// `app` for `/path/app.apk`.
pub fn package_base_name(package: &Path) -> Result<String> {
    package
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Input(format!("cannot derive a name from {}", package.display())))
}

/// `<dir>/<base>_Trust.<ext>` beside the input package.
pub fn output_artifact_path(package: &Path) -> Result<PathBuf> {
    let base = package_base_name(package)?;
    let ext = package
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("apk");
    let dir = package.parent().unwrap_or_else(|| Path::new(""));
    Ok(dir.join(format!("{}{}.{}", base, OUTPUT_SUFFIX, ext)))
}

/// Checks that run before anything is spawned or created on disk.
fn validate_inputs(request: &PipelineRequest) -> Result<usize> {
    let package = &request.package;
    if !package.is_file() {
        return Err(Error::Input(format!("package not found: {}", package.display())));
    }
    let credential = &request.credential;
    if !credential.keystore.is_file() {
        return Err(Error::Input(format!(
            "keystore not found: {}",
            credential.keystore.display()
        )));
    }
    for (value, field) in [
        (&credential.keystore_password, "keystore password"),
        (&credential.key_alias, "key alias"),
        (&credential.key_password, "key password"),
    ] {
        if value.is_empty() {
            return Err(Error::Input(format!("{} is required", field)));
        }
    }

    let file = std::fs::File::open(package)
        .map_err(|e| Error::Input(format!("cannot read {}: {}", package.display(), e)))?;
    let archive = zip::ZipArchive::new(file).map_err(|e| {
        Error::Input(format!(
            "{} is not a valid package archive: {}",
            package.display(),
            e
        ))
    })?;
    Ok(archive.len())
}

pub struct Pipeline {
    toolchain: Toolchain,
    config: RunConfig,
    workspaces: WorkspaceManager,
}

impl Pipeline {
    pub fn new(toolchain: Toolchain, config: RunConfig) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace_root(), config.keep_workspace);
        Self {
            toolchain,
            config,
            workspaces,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Turn `request.package` into a re-signed `<base>_Trust` package in the
    /// configured output directory.
    pub async fn process(
        &self,
        request: &PipelineRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Outcome {
        progress.emit(&format!("Processing {}", request.package.display()));

        let outcome = self.run(request, progress, cancel).await;
        match &outcome {
            Outcome::Succeeded { .. } => info!("{}", outcome),
            Outcome::Cancelled { .. } => info!("{}", outcome),
            Outcome::Failed { .. } => warn!("{}", outcome),
        }
        progress.emit(&outcome.message());
        outcome
    }

    async fn run(
        &self,
        request: &PipelineRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Outcome {
        let base = match validate_inputs(request).and_then(|entries| {
            progress.emit(&format!("Package archive is valid ({} entries)", entries));
            package_base_name(&request.package)
        }) {
            Ok(base) => base,
            Err(error) => return Outcome::Failed { stage: None, error },
        };

        if cancel.is_cancelled() {
            return Outcome::Cancelled {
                stage: Stage::Prepare,
            };
        }

        let acquired = self.acquire_workspace(&base, request.skip_decompile, progress);
        let (workspace, reused) = match acquired {
            Ok(acquired) => acquired,
            Err(error) => {
                return Outcome::Failed {
                    stage: Some(Stage::Prepare),
                    error,
                }
            }
        };

        let result = self.run_stages(request, &workspace, reused, progress, cancel).await;

        let path = workspace.path().to_path_buf();
        match workspace.release() {
            Release::Removed => progress.emit(&format!("Removed workspace {}", path.display())),
            Release::Kept => progress.emit(&format!("Workspace kept at {}", path.display())),
            Release::Failed(reason) => {
                warn!(path = %path.display(), "could not remove workspace: {}", reason);
                progress.emit(&format!("Could not remove workspace {}: {}", path.display(), reason))
            }
        }

        match result {
            Ok(artifact) => Outcome::Succeeded { artifact },
            Err(StageFailure {
                error: Error::Cancelled { stage },
                ..
            }) => Outcome::Cancelled { stage },
            Err(StageFailure { stage, error }) => Outcome::Failed {
                stage: Some(stage),
                error,
            },
        }
    }

    fn acquire_workspace(
        &self,
        base: &str,
        skip_decompile: bool,
        progress: &dyn ProgressSink,
    ) -> Result<(Workspace, bool)> {
        if skip_decompile {
            if let Some(workspace) = self.workspaces.reuse(base) {
                progress.emit(&format!(
                    "Reusing unpacked workspace {}",
                    workspace.path().display()
                ));
                return Ok((workspace, true));
            }
            progress.emit("No unpacked workspace to reuse, unpacking from scratch");
        }

        let workspace = self.workspaces.prepare(base)?;
        progress.emit(&format!("Created workspace {}", workspace.path().display()));
        Ok((workspace, false))
    }

    fn checkpoint(
        &self,
        next: Stage,
        cancel: &CancelToken,
    ) -> std::result::Result<(), StageFailure> {
        if cancel.is_cancelled() {
            return Err(StageFailure {
                stage: next,
                error: Error::Cancelled { stage: next },
            });
        }
        info!(stage = %next, "starting stage");
        Ok(())
    }

    async fn run_stages(
        &self,
        request: &PipelineRequest,
        workspace: &Workspace,
        reused: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> std::result::Result<PathBuf, StageFailure> {
        self.checkpoint(Stage::Unpack, cancel)?;
        if reused {
            progress.emit("Skipping unpack");
        } else {
            self.unpack(&request.package, workspace.path(), progress)
                .await
                .at(Stage::Unpack)?;
        }

        self.checkpoint(Stage::PatchNetworkConfig, cancel)?;
        self.patch_network_config(workspace, progress)
            .at(Stage::PatchNetworkConfig)?;

        if self.config.debuggable_enabled {
            self.checkpoint(Stage::PatchDebuggable, cancel)?;
            self.patch_debuggable(workspace, progress)
                .at(Stage::PatchDebuggable)?;
        }

        self.checkpoint(Stage::Repack, cancel)?;
        let artifact = self
            .repack(&request.package, workspace.path(), progress)
            .await
            .at(Stage::Repack)?;

        if self.config.zipalign_enabled {
            self.checkpoint(Stage::Align, cancel)?;
            self.align(&artifact, progress).await.at(Stage::Align)?;
        }

        self.checkpoint(Stage::Sign, cancel)?;
        self.sign(&artifact, &request.credential, progress)
            .await
            .at(Stage::Sign)?;

        self.checkpoint(Stage::Verify, cancel)?;
        self.verify(&artifact, progress).await.at(Stage::Verify)?;

        self.checkpoint(Stage::Publish, cancel)?;
        self.publish(&artifact, progress).at(Stage::Publish)
    }

    /// Run a tool and echo its command line and output to `progress`.
    async fn invoke(
        &self,
        tool: &Tool,
        args: Vec<OsString>,
        progress: &dyn ProgressSink,
    ) -> Result<ToolOutput> {
        progress.emit(&format!("$ {}", tool.describe(&args)));
        let output = tool.run(&args).await?;

        let stdout = output.stdout_text();
        if !stdout.trim().is_empty() {
            progress.emit(stdout.trim_end());
        }
        let stderr = output.stderr_text();
        if !stderr.trim().is_empty() {
            progress.emit(&format!("stderr:\n{}", stderr.trim_end()));
        }
        Ok(output)
    }

    async fn unpack(&self, package: &Path, dest: &Path, progress: &dyn ProgressSink) -> Result<()> {
        progress.emit("Unpacking package...");
        let args = vec![
            OsString::from("d"),
            OsString::from("-f"),
            package.as_os_str().to_owned(),
            OsString::from("-o"),
            dest.as_os_str().to_owned(),
        ];
        let output = self.invoke(&self.toolchain.apktool, args, progress).await?;
        if !output.success() {
            return Err(Error::Unpack(tool_failure(&output)));
        }
        progress.emit("Unpack complete");
        Ok(())
    }

    fn patch_network_config(
        &self,
        workspace: &Workspace,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        progress.emit("Patching network security config...");
        let manifest = AndroidManifest::load(&workspace.manifest_path())?;

        let Some(reference) = manifest.network_security_config_ref() else {
            progress.emit("No networkSecurityConfig declared, nothing to patch");
            return Ok(());
        };

        let Some(path) = manifest::resource_path(workspace.path(), &reference) else {
            progress.emit(&format!("Unrecognised resource reference {}, skipping", reference));
            return Ok(());
        };
        if !path.is_file() {
            progress.emit(&format!(
                "{} points to missing file {}, skipping",
                reference,
                path.display()
            ));
            return Ok(());
        }

        let mut config = NetworkSecurityConfig::load(&path)?;
        match config.ensure_user_trust_anchor()? {
            TrustPatch::Inserted => {
                config.save()?;
                progress.emit(&format!("Added user trust anchor to {}", path.display()));
            }
            TrustPatch::AlreadyPresent => {
                progress.emit(&format!("User trust anchor already present in {}", path.display()));
            }
        }
        Ok(())
    }

    fn patch_debuggable(&self, workspace: &Workspace, progress: &dyn ProgressSink) -> Result<()> {
        progress.emit("Checking debuggable flag...");
        let mut manifest = AndroidManifest::load(&workspace.manifest_path())?;
        match manifest.ensure_debuggable()? {
            DebuggablePatch::Set => progress.emit("Set android:debuggable=\"true\""),
            DebuggablePatch::AlreadySet => progress.emit("android:debuggable=\"true\" already set"),
        }
        Ok(())
    }

    async fn repack(
        &self,
        package: &Path,
        source: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        progress.emit("Repacking package...");
        let artifact = output_artifact_path(package)?;
        let args = vec![
            OsString::from("b"),
            source.as_os_str().to_owned(),
            OsString::from("-o"),
            artifact.as_os_str().to_owned(),
        ];
        let output = self.invoke(&self.toolchain.apktool, args, progress).await?;
        if !output.success() {
            return Err(Error::Repack(tool_failure(&output)));
        }
        progress.emit(&format!("Repacked to {}", artifact.display()));
        Ok(artifact)
    }

    /// Align into a side file, then move it over the original. A failed
    /// alignment leaves the repacked file as it was.
    async fn align(&self, artifact: &Path, progress: &dyn ProgressSink) -> Result<()> {
        progress.emit("Aligning package...");
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let side = artifact.with_file_name(format!("aligned_{}", file_name));
        if side.exists() {
            std::fs::remove_file(&side)
                .map_err(|e| Error::io(format!("removing stale {}", side.display()), e))?;
        }

        let args = vec![
            OsString::from("-v"),
            OsString::from(ALIGNMENT),
            artifact.as_os_str().to_owned(),
            side.as_os_str().to_owned(),
        ];
        let output = self.invoke(&self.toolchain.zipalign, args, progress).await?;
        if !output.success() {
            if let Err(e) = std::fs::remove_file(&side) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %side.display(), "could not remove partial aligned file: {}", e);
                }
            }
            return Err(Error::Align(tool_failure(&output)));
        }

        std::fs::rename(&side, artifact).map_err(|e| {
            Error::io(format!("replacing {} with aligned copy", artifact.display()), e)
        })?;
        progress.emit("Alignment complete");
        Ok(())
    }

    async fn sign(
        &self,
        artifact: &Path,
        credential: &SigningCredential,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        progress.emit(&format!(
            "Signing with {} (alias {})",
            credential.keystore.display(),
            credential.key_alias
        ));
        let args = vec![
            OsString::from("sign"),
            OsString::from("--v1-signing-enabled"),
            OsString::from("true"),
            OsString::from("--v2-signing-enabled"),
            OsString::from("true"),
            OsString::from("--ks"),
            credential.keystore.as_os_str().to_owned(),
            OsString::from("--ks-pass"),
            OsString::from(format!("pass:{}", credential.keystore_password)),
            OsString::from("--ks-key-alias"),
            OsString::from(&credential.key_alias),
            OsString::from("--key-pass"),
            OsString::from(format!("pass:{}", credential.key_password)),
            artifact.as_os_str().to_owned(),
        ];
        let output = self.invoke(&self.toolchain.apksigner, args, progress).await?;
        if !output.success() {
            return Err(Error::Sign(tool_failure(&output)));
        }
        progress.emit("Signing complete");
        Ok(())
    }

    async fn verify(&self, artifact: &Path, progress: &dyn ProgressSink) -> Result<()> {
        progress.emit("Verifying signature...");
        let args = vec![
            OsString::from("verify"),
            OsString::from("--verbose"),
            artifact.as_os_str().to_owned(),
        ];
        let output = self.invoke(&self.toolchain.apksigner, args, progress).await?;
        if !output.success() {
            return Err(Error::Verify(tool_failure(&output)));
        }
        progress.emit("Signature verified");
        Ok(())
    }

    fn publish(&self, artifact: &Path, progress: &dyn ProgressSink) -> Result<PathBuf> {
        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir)
            .map_err(|e| Error::io(format!("creating {}", output_dir.display()), e))?;

        let file_name = artifact
            .file_name()
            .ok_or_else(|| Error::Input(format!("no file name in {}", artifact.display())))?;
        let dest = output_dir.join(file_name);
        if dest.exists() {
            std::fs::remove_file(&dest)
                .map_err(|e| Error::io(format!("replacing {}", dest.display()), e))?;
        }

        if std::fs::rename(artifact, &dest).is_err() {
            // Different filesystems.
            std::fs::copy(artifact, &dest)
                .map_err(|e| Error::io(format!("copying to {}", dest.display()), e))?;
            std::fs::remove_file(artifact)
                .map_err(|e| Error::io(format!("removing {}", artifact.display()), e))?;
        }

        let size = std::fs::metadata(&dest)
            .map_err(|e| Error::io(format!("reading {}", dest.display()), e))?
            .len();
        let digest = calculate_blake3(&dest)?;
        progress.emit(&format!(
            "Published {} ({} bytes, blake3 {})",
            dest.display(),
            size,
            digest
        ));
        Ok(dest)
    }
}

fn calculate_blake3(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::io(format!("hashing {}", path.display()), e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_keeps_extension() {
        assert_eq!(
            output_artifact_path(Path::new("/apps/demo.apk")).unwrap(),
            PathBuf::from("/apps/demo_Trust.apk")
        );
        assert_eq!(
            output_artifact_path(Path::new("bundle.apks")).unwrap(),
            PathBuf::from("bundle_Trust.apks")
        );
        assert_eq!(
            output_artifact_path(Path::new("noext")).unwrap(),
            PathBuf::from("noext_Trust.apk")
        );
    }

    #[test]
    fn outcome_pairs() {
        let ok = Outcome::Succeeded {
            artifact: PathBuf::from("out/app_Trust.apk"),
        };
        assert_eq!(ok.as_pair(), (true, "Completed: out/app_Trust.apk".to_string()));

        let cancelled = Outcome::Cancelled { stage: Stage::Sign };
        assert_eq!(cancelled.as_pair(), (false, "Cancelled before sign".to_string()));
        assert!(cancelled.is_cancelled());

        let failed = Outcome::Failed {
            stage: Some(Stage::Unpack),
            error: Error::Unpack(ToolFailure {
                code: Some(1),
                diagnostic: "brut.androlib.AndrolibException".into(),
            }),
        };
        let (ok, message) = failed.as_pair();
        assert!(!ok);
        assert!(message.starts_with("Failed during unpack: Unpack Error"));
    }

    #[test]
    fn credential_converts_to_tuple() {
        let credential = SigningCredential {
            keystore: PathBuf::from("/keys/release.jks"),
            keystore_password: "a".into(),
            key_alias: "release".into(),
            key_password: "b".into(),
        };
        let tuple = credential.to_tuple();
        assert_eq!(tuple.cert_path, "/keys/release.jks");
        assert_eq!(tuple.key_alias, "release");
    }
}
