use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::keystore::{AliasReport, AliasResolver, Notice};

/// Treat `null` the same as an absent field.
fn nullable_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialTuple {
    #[serde(default, deserialize_with = "nullable_string")]
    pub cert_path: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub cert_password: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub key_alias: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub key_password: String,
}

impl CredentialTuple {
    fn usable(&self) -> bool {
        path_exists(&self.cert_path)
    }
}

/// The persisted state document. Unknown keys are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default, deserialize_with = "nullable_string")]
    pub apk_path: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub cert_path: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub cert_password: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub key_alias: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub key_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_cert: Option<CredentialTuple>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StateDocument {
    fn regular(&self) -> CredentialTuple {
        CredentialTuple {
            cert_path: self.cert_path.clone(),
            cert_password: self.cert_password.clone(),
            key_alias: self.key_alias.clone(),
            key_password: self.key_password.clone(),
        }
    }
}

/// Fields to overwrite; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub apk_path: Option<String>,
    pub cert_path: Option<String>,
    pub cert_password: Option<String>,
    pub key_alias: Option<String>,
    pub key_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    LastSuccess,
    Regular,
    None,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialSource::LastSuccess => "last_success",
            CredentialSource::Regular => "regular",
            CredentialSource::None => "none",
        })
    }
}

/// The credential set to offer, chosen by precedence at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveCredential {
    pub keystore_path: String,
    pub keystore_password: String,
    pub key_alias: String,
    pub key_password: String,
    pub source: CredentialSource,
}

impl EffectiveCredential {
    fn from_tuple(tuple: CredentialTuple, source: CredentialSource) -> Self {
        Self {
            keystore_path: tuple.cert_path,
            keystore_password: tuple.cert_password,
            key_alias: tuple.key_alias,
            key_password: tuple.key_password,
            source,
        }
    }

    fn none() -> Self {
        Self::from_tuple(CredentialTuple::default(), CredentialSource::None)
    }
}

fn path_exists(path: &str) -> bool {
    !path.trim().is_empty() && Path::new(path).exists()
}

/// Owns the state document and an in-process alias cache for the current
/// keystore.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    alias_cache: Option<(PathBuf, Vec<String>)>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias_cache: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document; a missing or malformed file is an empty document.
    pub fn load(&self) -> StateDocument {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), "could not read state: {}", e);
                }
                return StateDocument::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), "ignoring malformed state: {}", e);
            StateDocument::default()
        })
    }

    /// The raw document as stored.
    pub fn get_last_paths(&self) -> StateDocument {
        self.load()
    }

    pub fn save(&self, data: &StateDocument) -> Result<()> {
        let result = self.write(data);
        if let Err(e) = &result {
            warn!(path = %self.path.display(), "could not save state: {}", e);
        }
        result
    }

    fn write(&self, data: &StateDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let contents = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, contents)
            .map_err(|e| Error::io(format!("writing {}", self.path.display()), e))
    }

    pub fn update_fields(&mut self, update: CredentialUpdate) -> Result<()> {
        let mut data = self.load();
        if let Some(cert_path) = update.cert_path {
            self.invalidate_if_changed(Path::new(&cert_path));
            data.cert_path = cert_path;
        }
        if let Some(apk_path) = update.apk_path {
            data.apk_path = apk_path;
        }
        if let Some(cert_password) = update.cert_password {
            data.cert_password = cert_password;
        }
        if let Some(key_alias) = update.key_alias {
            data.key_alias = key_alias;
        }
        if let Some(key_password) = update.key_password {
            data.key_password = key_password;
        }
        self.save(&data)
    }

    /// Record the credentials of a completed run. The regular fields are
    /// overwritten too, so both instances agree afterwards.
    pub fn save_last_success(&mut self, tuple: &CredentialTuple) -> Result<()> {
        self.invalidate_if_changed(Path::new(&tuple.cert_path));
        let mut data = self.load();
        data.cert_path = tuple.cert_path.clone();
        data.cert_password = tuple.cert_password.clone();
        data.key_alias = tuple.key_alias.clone();
        data.key_password = tuple.key_password.clone();
        data.last_success_cert = Some(tuple.clone());
        self.save(&data)
    }

    pub fn persist_key_alias(&mut self, alias: &str) -> Result<()> {
        if alias.is_empty() {
            return Ok(());
        }
        self.update_fields(CredentialUpdate {
            key_alias: Some(alias.to_string()),
            ..Default::default()
        })
    }

    pub fn remember_package(&mut self, apk_path: &Path) -> Result<()> {
        self.update_fields(CredentialUpdate {
            apk_path: Some(apk_path.to_string_lossy().into_owned()),
            ..Default::default()
        })
    }

    pub fn remember_keystore(&mut self, keystore: &Path) -> Result<()> {
        self.update_fields(CredentialUpdate {
            cert_path: Some(keystore.to_string_lossy().into_owned()),
            ..Default::default()
        })
    }

    /// Record everything entered for a run as the regular tuple, before the
    /// run starts. The five fields are written together so the regular tuple
    /// never pairs one keystore with another's passwords.
    pub fn remember_entered(&mut self, apk_path: &Path, tuple: &CredentialTuple) -> Result<()> {
        self.update_fields(CredentialUpdate {
            apk_path: Some(apk_path.to_string_lossy().into_owned()),
            cert_path: Some(tuple.cert_path.clone()),
            cert_password: Some(tuple.cert_password.clone()),
            key_alias: Some(tuple.key_alias.clone()),
            key_password: Some(tuple.key_password.clone()),
        })
    }

    pub fn forget(&mut self) -> Result<()> {
        self.alias_cache = None;
        self.save(&StateDocument::default())
    }

    /// Prefer the last successful tuple, then the regular one, skipping any
    /// whose keystore no longer exists.
    pub fn get_effective_credential(&self) -> EffectiveCredential {
        let data = self.load();

        if let Some(last) = data.last_success_cert.clone().filter(CredentialTuple::usable) {
            return EffectiveCredential::from_tuple(last, CredentialSource::LastSuccess);
        }

        let regular = data.regular();
        if regular.usable() {
            return EffectiveCredential::from_tuple(regular, CredentialSource::Regular);
        }

        EffectiveCredential::none()
    }

    /// Whether aliases should be listed at startup without user action.
    pub fn should_auto_resolve(&self, path: &str, password: &str) -> bool {
        path_exists(path) && !password.trim().is_empty()
    }

    /// Pick an alias from a freshly listed set: last successful alias, then
    /// the regular one, then the first listed.
    pub fn choose_alias_for_startup(&self, aliases: &[String]) -> (Option<String>, Vec<String>) {
        if aliases.is_empty() {
            return (None, Vec::new());
        }

        let data = self.load();
        let remembered = data
            .last_success_cert
            .as_ref()
            .map(|last| last.key_alias.as_str())
            .into_iter()
            .chain(std::iter::once(data.key_alias.as_str()))
            .filter(|alias| !alias.is_empty())
            .find(|alias| aliases.iter().any(|a| a == alias));

        match remembered {
            Some(alias) => (
                Some(alias.to_string()),
                vec![format!("Restored previous key alias: {}", alias)],
            ),
            None => (
                Some(aliases[0].clone()),
                vec![format!("Selected key alias automatically: {}", aliases[0])],
            ),
        }
    }

    /// Aliases listed earlier in this process for `keystore`, if still valid.
    pub fn cached_aliases(&self, keystore: &Path) -> Option<&[String]> {
        match &self.alias_cache {
            Some((path, aliases)) if path == keystore => Some(aliases),
            _ => None,
        }
    }

    /// List the aliases in `keystore`, answering from the cache when the same
    /// keystore was listed before. Only clean, non-empty listings are cached.
    pub async fn resolve_aliases(
        &mut self,
        resolver: &AliasResolver,
        keystore: &Path,
        storepass: &str,
    ) -> AliasReport {
        if let Some(aliases) = self.cached_aliases(keystore) {
            return AliasReport {
                aliases: aliases.to_vec(),
                messages: Vec::new(),
            };
        }

        self.invalidate_if_changed(keystore);
        let report = resolver.read_aliases(keystore, storepass).await;
        if !report.aliases.is_empty() && !report.messages.iter().any(Notice::is_error) {
            self.cache_aliases(keystore, report.aliases.clone());
        }
        report
    }

    pub fn cache_aliases(&mut self, keystore: &Path, aliases: Vec<String>) {
        self.alias_cache = Some((keystore.to_path_buf(), aliases));
    }

    fn invalidate_if_changed(&mut self, keystore: &Path) {
        if self.cached_aliases(keystore).is_none() {
            self.alias_cache = None;
        }
    }
}
