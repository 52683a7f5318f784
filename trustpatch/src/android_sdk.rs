use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Optional explicit locations, read from `tools.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolOverrides {
    pub sdk_root: Option<PathBuf>,
    pub build_tools_version: Option<String>,
    pub java: Option<PathBuf>,
    pub keytool: Option<PathBuf>,
    pub apktool_jar: Option<PathBuf>,
    /// A wrapper executable used instead of `java -jar apktool.jar`.
    pub apktool: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AndroidSdk {
    pub sdk_path: PathBuf,
    pub build_tools_version: String,
}

impl AndroidSdk {
    /// Find Android SDK from overrides, environment or default locations
    pub fn find(overrides: &ToolOverrides) -> Result<Self> {
        let sdk_path = if let Some(path) = &overrides.sdk_root {
            path.clone()
        } else if let Some(path) = std::env::var_os("ANDROID_SDK_ROOT") {
            PathBuf::from(path)
        } else if let Some(path) = std::env::var_os("ANDROID_HOME") {
            PathBuf::from(path)
        } else {
            default_sdk_locations()
                .into_iter()
                .find(|p| p.join("build-tools").is_dir())
                .ok_or_else(|| {
                    Error::Config(
                        "Android SDK not found. Set ANDROID_SDK_ROOT or ANDROID_HOME".into(),
                    )
                })?
        };

        let build_tools_dir = sdk_path.join("build-tools");
        if !build_tools_dir.is_dir() {
            return Err(Error::Config(format!(
                "Android SDK build-tools not found in {}",
                sdk_path.display()
            )));
        }

        let build_tools_version = match &overrides.build_tools_version {
            Some(version) => version.clone(),
            None => latest_build_tools(&sdk_path).ok_or_else(|| {
                Error::Config(format!(
                    "No build-tools version containing apksigner and zipalign under {}",
                    build_tools_dir.display()
                ))
            })?,
        };

        Ok(Self {
            sdk_path,
            build_tools_version,
        })
    }

    /// Get path to a build tool
    pub fn tool_path(&self, tool: &str) -> PathBuf {
        self.sdk_path
            .join("build-tools")
            .join(&self.build_tools_version)
            .join(platform_tool_name(tool))
    }
}

fn default_sdk_locations() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(home) = pathos::xdg::home_dir() {
        paths.push(home.join("Library/Android/sdk"));
        paths.push(home.join("Android/Sdk"));
        paths.push(home.join("AppData/Local/Android/Sdk"));
    }
    paths.push(PathBuf::from("/usr/local/android-sdk"));
    paths
}

fn platform_tool_name(tool: &str) -> String {
    if cfg!(windows) {
        match tool {
            "apksigner" => "apksigner.bat".to_string(),
            other => format!("{}.exe", other),
        }
    } else {
        tool.to_string()
    }
}

/// Highest build-tools version that ships both apksigner and zipalign.
fn latest_build_tools(sdk_path: &Path) -> Option<String> {
    let root = glob::Pattern::escape(&sdk_path.join("build-tools").to_string_lossy());
    let pattern = format!("{}/*/{}", root, platform_tool_name("apksigner"));

    glob::glob(&pattern)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|apksigner| {
            let dir = apksigner.parent()?;
            if !dir.join(platform_tool_name("zipalign")).exists() {
                return None;
            }
            dir.file_name()?.to_str().map(str::to_string)
        })
        .max_by(|a, b| version_key(a).cmp(&version_key(b)))
}

/// Numeric ordering key for versions like `35.0.0` or `34.0.0-rc3`.
/// A pre-release sorts below the matching release.
pub(crate) fn version_key(version: &str) -> (Vec<u32>, bool) {
    let (release, pre) = match version.split_once('-') {
        Some((release, pre)) => (release, Some(pre)),
        None => (version, None),
    };
    let parts = release
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect();
    (parts, pre.is_none())
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    match which::which(name) {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("'{}' not found on PATH: {}", name, e);
            None
        }
    }
}

fn find_java_tool(name: &str, explicit: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(Error::Config(format!(
            "{} not found at configured path {}",
            name,
            path.display()
        )));
    }

    if let Some(java_home) = std::env::var_os("JAVA_HOME") {
        let candidate = PathBuf::from(java_home)
            .join("bin")
            .join(if cfg!(windows) {
                format!("{}.exe", name)
            } else {
                name.to_string()
            });
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    find_on_path(name).ok_or_else(|| {
        Error::Config(format!(
            "{} not found. Install a JDK and set JAVA_HOME or add it to PATH",
            name
        ))
    })
}

/// Captured result of one external tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stderr when the tool wrote any, otherwise stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr_text();
        if stderr.trim().is_empty() {
            self.stdout_text()
        } else {
            stderr
        }
    }
}

/// An external program plus any arguments that always precede the call's own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub program: PathBuf,
    pub leading_args: Vec<OsString>,
}

impl Tool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            leading_args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run the tool to completion, capturing both output streams.
    pub async fn run<I, S>(&self, args: I) -> Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!(command = %self.describe(&args), "running tool");

        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::ToolLaunch {
                program: self.program.clone(),
                source,
            })?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Command line for logs, with passwords masked.
    pub fn describe(&self, args: &[OsString]) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        let mut mask_next = false;
        for arg in self.leading_args.iter().chain(args) {
            let arg = arg.to_string_lossy();
            if mask_next {
                parts.push("****".to_string());
                mask_next = false;
            } else if arg.starts_with("pass:") {
                parts.push("pass:****".to_string());
            } else {
                mask_next = matches!(arg.as_ref(), "-storepass" | "-keypass");
                parts.push(arg.into_owned());
            }
        }
        parts.join(" ")
    }
}

/// Every external tool the pipeline and alias resolver drive, resolved once.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub apktool: Tool,
    pub zipalign: Tool,
    pub apksigner: Tool,
    pub keytool: Tool,
    pub sdk: Option<AndroidSdk>,
}

impl Toolchain {
    pub fn from_tools(apktool: Tool, zipalign: Tool, apksigner: Tool, keytool: Tool) -> Self {
        Self {
            apktool,
            zipalign,
            apksigner,
            keytool,
            sdk: None,
        }
    }

    /// Locate every tool up front so a missing one fails before any run starts.
    ///
    /// `tools_dir` is searched for `apktool.jar` when no override is given.
    pub fn discover(overrides: &ToolOverrides, tools_dir: &Path) -> Result<Self> {
        let sdk = AndroidSdk::find(overrides)?;

        let apksigner = sdk.tool_path("apksigner");
        let zipalign = sdk.tool_path("zipalign");
        for path in [&apksigner, &zipalign] {
            if !path.exists() {
                return Err(Error::Config(format!("Build tool not found: {}", path.display())));
            }
        }

        let keytool = find_java_tool("keytool", overrides.keytool.as_ref())?;
        let apktool = Self::find_apktool(overrides, tools_dir)?;

        debug!(
            sdk = %sdk.sdk_path.display(),
            build_tools = %sdk.build_tools_version,
            "toolchain discovered"
        );

        Ok(Self {
            apktool,
            zipalign: Tool::new(zipalign),
            apksigner: Tool::new(apksigner),
            keytool: Tool::new(keytool),
            sdk: Some(sdk),
        })
    }

    /// Only keytool, for listing aliases without a full SDK.
    pub fn discover_keytool(overrides: &ToolOverrides) -> Result<Tool> {
        find_java_tool("keytool", overrides.keytool.as_ref()).map(Tool::new)
    }

    fn find_apktool(overrides: &ToolOverrides, tools_dir: &Path) -> Result<Tool> {
        if let Some(wrapper) = &overrides.apktool {
            if !wrapper.exists() {
                return Err(Error::Config(format!(
                    "apktool not found at configured path {}",
                    wrapper.display()
                )));
            }
            return Ok(Tool::new(wrapper));
        }

        let jar = match &overrides.apktool_jar {
            Some(jar) => Some(jar.clone()),
            None => Some(tools_dir.join("apktool.jar")).filter(|jar| jar.exists()),
        };

        if let Some(jar) = jar {
            if !jar.exists() {
                return Err(Error::Config(format!("apktool.jar not found: {}", jar.display())));
            }
            let java = find_java_tool("java", overrides.java.as_ref())?;
            let mut args = vec![OsString::from("-jar")];
            args.push(jar.into_os_string());
            return Ok(Tool::with_args(java, args));
        }

        find_on_path("apktool").map(Tool::new).ok_or_else(|| {
            Error::Config(format!(
                "apktool not found. Place apktool.jar in {} or set apktool_jar in tools.toml",
                tools_dir.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_key_orders_numerically() {
        assert!(version_key("35.0.0") > version_key("34.0.0"));
        assert!(version_key("10.0.0") > version_key("9.0.0"));
        assert!(version_key("34.0.0") > version_key("34.0.0-rc3"));
        assert!(version_key("34.0.0-rc3") > version_key("33.0.2"));
        assert_eq!(version_key("33.0.1"), (vec![33, 0, 1], true));
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn find_picks_highest_complete_build_tools() {
        let sdk = tempfile::tempdir().unwrap();
        let bt = sdk.path().join("build-tools");
        for version in ["9.0.0", "30.0.3", "35.0.0"] {
            touch(&bt.join(version).join(platform_tool_name("apksigner")));
        }
        touch(&bt.join("9.0.0").join(platform_tool_name("zipalign")));
        touch(&bt.join("30.0.3").join(platform_tool_name("zipalign")));
        // 35.0.0 lacks zipalign and must be skipped

        let overrides = ToolOverrides {
            sdk_root: Some(sdk.path().to_path_buf()),
            ..Default::default()
        };
        let found = AndroidSdk::find(&overrides).unwrap();
        assert_eq!(found.build_tools_version, "30.0.3");
        assert_eq!(
            found.tool_path("zipalign"),
            bt.join("30.0.3").join(platform_tool_name("zipalign"))
        );
    }

    #[test]
    fn find_fails_without_build_tools() {
        let sdk = tempfile::tempdir().unwrap();
        let overrides = ToolOverrides {
            sdk_root: Some(sdk.path().to_path_buf()),
            ..Default::default()
        };
        let err = AndroidSdk::find(&overrides).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn describe_masks_passwords() {
        let tool = Tool::new("apksigner");
        let args: Vec<OsString> = ["sign", "--ks-pass", "pass:hunter2", "--ks", "a.jks"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(tool.describe(&args), "apksigner sign --ks-pass pass:**** --ks a.jks");

        let keytool = Tool::new("keytool");
        let args: Vec<OsString> = ["-list", "-storepass", "hunter2"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(keytool.describe(&args), "keytool -list -storepass ****");
    }

    #[cfg(unix)]
    #[test]
    fn path_lookup_finds_installed_programs() {
        let sh = find_on_path("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(sh.is_file());
        assert_eq!(find_on_path("trustpatch-no-such-tool"), None);
    }

    #[tokio::test]
    async fn run_reports_launch_failure() {
        let tool = Tool::new("/nonexistent/trustpatch-tool");
        let err = tool.run(["--version"]).await.unwrap_err();
        assert!(matches!(err, Error::ToolLaunch { .. }));
    }
}
