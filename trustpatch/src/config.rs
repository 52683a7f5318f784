use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::android_sdk::ToolOverrides;
use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "app_config.json";
pub const STATE_FILE: &str = "last_paths.json";
pub const TOOLS_FILE: &str = "tools.toml";

/// Where the persisted documents live, `~/.trustpatch` by default.
#[derive(Debug, Clone)]
pub struct AppDirs {
    root: PathBuf,
}

impl AppDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_home() -> Result<Self> {
        let home = pathos::xdg::home_dir()
            .map_err(|e| Error::Config(format!("Could not find home directory: {}", e)))?;
        Ok(Self::new(home.join(".trustpatch")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn tools_file(&self) -> PathBuf {
        self.root.join(TOOLS_FILE)
    }

    /// Searched for `apktool.jar` when `tools.toml` names none.
    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    /// Read `tools.toml`; a missing file means no overrides.
    pub fn load_tool_overrides(&self) -> Result<ToolOverrides> {
        let path = self.tools_file();
        if !path.exists() {
            return Ok(ToolOverrides::default());
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Ok(toml::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub zipalign_enabled: bool,
    pub debuggable_enabled: bool,
    pub output_dir: PathBuf,
    pub skip_decompile_enabled: bool,
    /// Leave the workspace on disk after the run for inspection.
    pub keep_workspace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            zipalign_enabled: false,
            debuggable_enabled: true,
            output_dir: PathBuf::from("output"),
            skip_decompile_enabled: false,
            keep_workspace: false,
            workspace_root: None,
        }
    }
}

impl RunConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("trustpatch"))
    }
}

/// The run configuration document; every mutation is saved immediately.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: RunConfig,
}

impl ConfigStore {
    /// Load `path`, falling back to defaults when it is absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "ignoring malformed configuration: {}", e);
                RunConfig::default()
            }),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "could not read configuration: {}", e);
                }
                RunConfig::default()
            }
        };
        Self { path, config }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let contents = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&self.path, contents)
            .map_err(|e| Error::io(format!("writing {}", self.path.display()), e))
    }

    pub fn update(&mut self, mutate: impl FnOnce(&mut RunConfig)) -> Result<()> {
        mutate(&mut self.config);
        self.save()
    }

    /// Set a field by its document key, as typed on the command line.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let flag = || -> Result<bool> {
            match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(Error::Config(format!("'{}' is not a boolean value for {}", value, key))),
            }
        };

        match key {
            "zipalign_enabled" => {
                let v = flag()?;
                self.update(|c| c.zipalign_enabled = v)
            }
            "debuggable_enabled" => {
                let v = flag()?;
                self.update(|c| c.debuggable_enabled = v)
            }
            "skip_decompile_enabled" => {
                let v = flag()?;
                self.update(|c| c.skip_decompile_enabled = v)
            }
            "keep_workspace" => {
                let v = flag()?;
                self.update(|c| c.keep_workspace = v)
            }
            "output_dir" => self.update(|c| c.output_dir = PathBuf::from(value)),
            "workspace_root" => self.update(|c| {
                c.workspace_root = Some(value).filter(|v| !v.is_empty()).map(PathBuf::from)
            }),
            other => Err(Error::Config(format!("unknown configuration key '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join(CONFIG_FILE));
        assert_eq!(store.config(), &RunConfig::default());
        assert!(store.config().debuggable_enabled);
        assert!(!store.config().zipalign_enabled);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::load(&path);
        assert_eq!(store.config(), &RunConfig::default());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"zipalign_enabled": true}"#).unwrap();
        let store = ConfigStore::load(&path);
        assert!(store.config().zipalign_enabled);
        assert!(store.config().debuggable_enabled);
        assert_eq!(store.config().output_dir, PathBuf::from("output"));
    }

    #[test]
    fn set_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut store = ConfigStore::load(&path);
        store.set("zipalign_enabled", "true").unwrap();
        store.set("output_dir", "/srv/apks").unwrap();

        let reloaded = ConfigStore::load(&path);
        assert!(reloaded.config().zipalign_enabled);
        assert_eq!(reloaded.config().output_dir, PathBuf::from("/srv/apks"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["skip_decompile_enabled"], serde_json::Value::Bool(false));
    }

    #[test]
    fn set_rejects_unknown_key_and_bad_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::load(dir.path().join(CONFIG_FILE));
        assert!(matches!(store.set("colour", "blue"), Err(Error::Config(_))));
        assert!(matches!(store.set("zipalign_enabled", "maybe"), Err(Error::Config(_))));
    }

    #[test]
    fn tool_overrides_read_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = AppDirs::new(dir.path());
        assert_eq!(dirs.load_tool_overrides().unwrap(), ToolOverrides::default());

        std::fs::write(
            dirs.tools_file(),
            "sdk_root = \"/opt/android\"\nbuild_tools_version = \"35.0.0\"\napktool_jar = \"/opt/apktool.jar\"\n",
        )
        .unwrap();
        let overrides = dirs.load_tool_overrides().unwrap();
        assert_eq!(overrides.sdk_root, Some(PathBuf::from("/opt/android")));
        assert_eq!(overrides.build_tools_version.as_deref(), Some("35.0.0"));
        assert_eq!(overrides.apktool_jar, Some(PathBuf::from("/opt/apktool.jar")));
        assert_eq!(overrides.java, None);
    }
}
