//! Edits to the decoded `AndroidManifest.xml` and its network security config.
//!
//! Attribute names in the manifest are namespace-qualified. The prefix bound to
//! [`ANDROID_NS`] is looked up from the document's own `xmlns:` declarations
//! instead of assuming `android:`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use xmlem::{Document, Element, NewElement};

use crate::error::{Error, Result};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

static ANDROID_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"xmlns:([A-Za-z_][\w.-]*)\s*=\s*["']http://schemas\.android\.com/apk/res/android["']"#,
    )
    .expect("valid namespace regex")
});

/// State of a boolean-valued attribute; absent and `false` are distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeState {
    Absent,
    True,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggablePatch {
    Set,
    AlreadySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPatch {
    Inserted,
    AlreadyPresent,
}

fn parse(path: &Path, text: &str) -> Result<Document> {
    Document::from_reader(std::io::Cursor::new(text)).map_err(|e| Error::Xml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn serialize(doc: &Document) -> String {
    let body = doc.to_string_pretty();
    if body.trim_start().starts_with("<?xml") {
        body
    } else {
        format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}", body)
    }
}

fn write(path: &Path, doc: &Document) -> Result<()> {
    std::fs::write(path, serialize(doc))
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

fn find_child(doc: &Document, parent: &Element, name: &str) -> Option<Element> {
    parent.children(doc).into_iter().find(|child| child.name(doc) == name)
}

fn find_descendant(doc: &Document, parent: &Element, name: &str) -> Option<Element> {
    for child in parent.children(doc) {
        if child.name(doc) == name {
            return Some(child);
        }
        if let Some(found) = find_descendant(doc, &child, name) {
            return Some(found);
        }
    }
    None
}

fn new_element(path: &Path, name: &str) -> Result<NewElement> {
    let name = name.try_into().map_err(|_| Error::Xml {
        path: path.to_path_buf(),
        message: format!("invalid element name '{}'", name),
    })?;
    Ok(NewElement {
        name,
        attrs: Default::default(),
    })
}

fn no_application() -> Error {
    Error::Manifest("no <application> element in AndroidManifest.xml".into())
}

pub struct AndroidManifest {
    path: PathBuf,
    doc: Document,
    android_prefix: String,
}

impl AndroidManifest {
    /// Load the decoded manifest. A missing file is a [`Error::Manifest`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Manifest(format!(
                "AndroidManifest.xml not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let android_prefix = ANDROID_PREFIX
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "android".to_string());

        Ok(Self {
            path: path.to_path_buf(),
            doc: parse(path, text)?,
            android_prefix,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn android_attr(&self, local: &str) -> String {
        format!("{}:{}", self.android_prefix, local)
    }

    fn application(&self) -> Option<Element> {
        let root = self.doc.root();
        find_descendant(&self.doc, &root, "application")
    }

    /// The `@xml/...` reference declared by `android:networkSecurityConfig`.
    pub fn network_security_config_ref(&self) -> Option<String> {
        let name = self.android_attr("networkSecurityConfig");
        let root = self.doc.root();
        self.application()
            .and_then(|app| app.attribute(&self.doc, &name).map(str::to_string))
            .or_else(|| root.attribute(&self.doc, &name).map(str::to_string))
            .filter(|value| !value.trim().is_empty())
    }

    pub fn debuggable_state(&self) -> Result<AttributeState> {
        let app = self.application().ok_or_else(no_application)?;
        Ok(match app.attribute(&self.doc, &self.android_attr("debuggable")) {
            None => AttributeState::Absent,
            Some("true") => AttributeState::True,
            Some(other) => AttributeState::Other(other.to_string()),
        })
    }

    /// Set `android:debuggable="true"` on `<application>` unless it already is.
    /// Only writes the file when something changed.
    pub fn ensure_debuggable(&mut self) -> Result<DebuggablePatch> {
        if self.debuggable_state()? == AttributeState::True {
            return Ok(DebuggablePatch::AlreadySet);
        }
        let name = self.android_attr("debuggable");
        let app = self.application().ok_or_else(no_application)?;
        app.set_attribute(&mut self.doc, name.as_str(), "true");
        self.save()?;
        Ok(DebuggablePatch::Set)
    }

    pub fn save(&self) -> Result<()> {
        write(&self.path, &self.doc)
    }

    pub fn to_xml(&self) -> String {
        serialize(&self.doc)
    }
}

/// Map a resource reference such as `@xml/network_security_config` to its
/// decoded file under `workspace`.
pub fn resource_path(workspace: &Path, reference: &str) -> Option<PathBuf> {
    let reference = reference.trim().strip_prefix('@')?;
    let (kind, name) = reference.split_once('/')?;
    let kind = kind.rsplit(':').next().unwrap_or(kind);
    if name.is_empty() || name.contains("..") {
        return None;
    }
    Some(workspace.join("res").join(kind).join(format!("{}.xml", name)))
}

pub struct NetworkSecurityConfig {
    path: PathBuf,
    doc: Document,
}

impl NetworkSecurityConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            doc: parse(path, text)?,
        })
    }

    fn trust_anchors(&self) -> Option<Element> {
        let root = self.doc.root();
        let base = find_child(&self.doc, &root, "base-config")?;
        find_child(&self.doc, &base, "trust-anchors")
    }

    /// Number of `<certificates source="user"/>` entries under base-config.
    pub fn user_certificate_count(&self) -> usize {
        let Some(anchors) = self.trust_anchors() else {
            return 0;
        };
        anchors
            .children(&self.doc)
            .into_iter()
            .filter(|c| {
                c.name(&self.doc) == "certificates"
                    && c.attribute(&self.doc, "source") == Some("user")
            })
            .count()
    }

    /// Ensure `<base-config><trust-anchors><certificates source="user"/>`,
    /// creating whichever of the enclosing elements is missing.
    pub fn ensure_user_trust_anchor(&mut self) -> Result<TrustPatch> {
        if self.user_certificate_count() > 0 {
            return Ok(TrustPatch::AlreadyPresent);
        }

        let root = self.doc.root();
        let base = match find_child(&self.doc, &root, "base-config") {
            Some(base) => base,
            None => {
                let element = new_element(&self.path, "base-config")?;
                root.append_new_element(&mut self.doc, element)
            }
        };
        let anchors = match find_child(&self.doc, &base, "trust-anchors") {
            Some(anchors) => anchors,
            None => {
                let element = new_element(&self.path, "trust-anchors")?;
                base.append_new_element(&mut self.doc, element)
            }
        };
        let element = new_element(&self.path, "certificates")?;
        let certificates = anchors.append_new_element(&mut self.doc, element);
        certificates.set_attribute(&mut self.doc, "source", "user");

        Ok(TrustPatch::Inserted)
    }

    pub fn save(&self) -> Result<()> {
        write(&self.path, &self.doc)
    }

    pub fn to_xml(&self) -> String {
        serialize(&self.doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <application android:label="@string/app_name" android:networkSecurityConfig="@xml/network_security_config">
        <activity android:name=".MainActivity"/>
    </application>
</manifest>"#;

    const CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <domain-config cleartextTrafficPermitted="true">
        <domain includeSubdomains="true">example.com</domain>
    </domain-config>
</network-security-config>"#;

    fn count_user_sources(xml: &str) -> usize {
        xml.matches(r#"source="user""#).count()
    }

    #[test]
    fn reads_network_security_config_reference() {
        let manifest = AndroidManifest::parse(Path::new("AndroidManifest.xml"), MANIFEST).unwrap();
        assert_eq!(
            manifest.network_security_config_ref().as_deref(),
            Some("@xml/network_security_config")
        );
    }

    #[test]
    fn resolves_custom_namespace_prefix() {
        let text = r#"<manifest xmlns:a="http://schemas.android.com/apk/res/android"><application a:debuggable="false" a:networkSecurityConfig="@xml/nsc"/></manifest>"#;
        let manifest = AndroidManifest::parse(Path::new("m.xml"), text).unwrap();
        assert_eq!(manifest.network_security_config_ref().as_deref(), Some("@xml/nsc"));
        assert_eq!(
            manifest.debuggable_state().unwrap(),
            AttributeState::Other("false".into())
        );
    }

    #[test]
    fn missing_reference_is_none() {
        let text = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"><application/></manifest>"#;
        let manifest = AndroidManifest::parse(Path::new("m.xml"), text).unwrap();
        assert_eq!(manifest.network_security_config_ref(), None);
        assert_eq!(manifest.debuggable_state().unwrap(), AttributeState::Absent);
    }

    #[test]
    fn resource_path_maps_xml_reference() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(
            resource_path(ws, "@xml/network_security_config"),
            Some(ws.join("res/xml/network_security_config.xml"))
        );
        assert_eq!(resource_path(ws, "network_security_config"), None);
        assert_eq!(resource_path(ws, "@xml/../../etc/passwd"), None);
    }

    #[test]
    fn trust_anchor_is_inserted_once() {
        let mut config = NetworkSecurityConfig::parse(Path::new("nsc.xml"), CONFIG).unwrap();
        assert_eq!(config.user_certificate_count(), 0);
        assert_eq!(config.ensure_user_trust_anchor().unwrap(), TrustPatch::Inserted);
        let once = config.to_xml();

        assert_eq!(config.ensure_user_trust_anchor().unwrap(), TrustPatch::AlreadyPresent);
        let twice = config.to_xml();

        assert_eq!(once, twice);
        assert_eq!(config.user_certificate_count(), 1);
        assert_eq!(count_user_sources(&twice), 1);
        assert!(twice.contains("<domain-config"));
    }

    #[test]
    fn trust_anchor_reuses_existing_base_config() {
        let text = r#"<network-security-config><base-config cleartextTrafficPermitted="false"><trust-anchors><certificates source="system"/></trust-anchors></base-config></network-security-config>"#;
        let mut config = NetworkSecurityConfig::parse(Path::new("nsc.xml"), text).unwrap();
        assert_eq!(config.ensure_user_trust_anchor().unwrap(), TrustPatch::Inserted);
        let xml = config.to_xml();
        assert_eq!(xml.matches("<base-config").count(), 1);
        assert_eq!(xml.matches("<trust-anchors").count(), 1);
        assert!(xml.contains(r#"source="system""#));
        assert_eq!(count_user_sources(&xml), 1);
    }

    #[test]
    fn existing_user_anchor_is_left_alone() {
        let text = r#"<network-security-config><base-config><trust-anchors><certificates source="user"/></trust-anchors></base-config></network-security-config>"#;
        let mut config = NetworkSecurityConfig::parse(Path::new("nsc.xml"), text).unwrap();
        assert_eq!(config.ensure_user_trust_anchor().unwrap(), TrustPatch::AlreadyPresent);
    }

    #[test]
    fn debuggable_already_true_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AndroidManifest.xml");
        let text = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"><application android:debuggable="true"/></manifest>"#;
        std::fs::write(&path, text).unwrap();

        let mut manifest = AndroidManifest::load(&path).unwrap();
        assert_eq!(manifest.ensure_debuggable().unwrap(), DebuggablePatch::AlreadySet);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn debuggable_false_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AndroidManifest.xml");
        let text = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"><application android:debuggable="false"/></manifest>"#;
        std::fs::write(&path, text).unwrap();

        let mut manifest = AndroidManifest::load(&path).unwrap();
        assert_eq!(manifest.ensure_debuggable().unwrap(), DebuggablePatch::Set);

        let reloaded = AndroidManifest::load(&path).unwrap();
        assert_eq!(reloaded.debuggable_state().unwrap(), AttributeState::True);
    }

    #[test]
    fn debuggable_set_under_custom_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AndroidManifest.xml");
        std::fs::write(
            &path,
            r#"<manifest xmlns:a="http://schemas.android.com/apk/res/android"><application a:label="x"/></manifest>"#,
        )
        .unwrap();

        let mut manifest = AndroidManifest::load(&path).unwrap();
        assert_eq!(manifest.ensure_debuggable().unwrap(), DebuggablePatch::Set);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(r#"a:debuggable="true""#), "{written}");
        assert!(!written.contains("android:debuggable"));
    }

    #[test]
    fn missing_application_is_manifest_error() {
        let text = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"/>"#;
        let mut manifest = AndroidManifest::parse(Path::new("m.xml"), text).unwrap();
        assert!(matches!(manifest.ensure_debuggable(), Err(Error::Manifest(_))));
    }

    #[test]
    fn missing_manifest_file_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AndroidManifest::load(&dir.path().join("AndroidManifest.xml")).err().unwrap();
        assert!(matches!(err, Error::Manifest(_)));
    }
}
