#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use trustpatch::{RunConfig, SigningCredential, Tool, Toolchain};

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.demo">
    <application android:label="Demo" android:networkSecurityConfig="@xml/network_security_config">
        <activity android:name=".MainActivity"/>
    </application>
</manifest>
"#;

pub const NETWORK_CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <domain-config cleartextTrafficPermitted="true">
        <domain includeSubdomains="true">example.com</domain>
    </domain-config>
</network-security-config>
"#;

/// Scratch layout for one pipeline run: fixture tree, fake tools, input
/// package and keystore.
pub struct Harness {
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let harness = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        harness.write_fixture(MANIFEST, Some(NETWORK_CONFIG));
        std::fs::create_dir_all(harness.path("bin")).unwrap();
        std::fs::write(harness.keystore(), b"not really a keystore").unwrap();
        harness.write_package("app.apk");
        harness
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// What the fake apktool "decodes" every package into.
    pub fn write_fixture(&self, manifest: &str, network_config: Option<&str>) {
        let fixture = self.path("fixture");
        let _ = std::fs::remove_dir_all(&fixture);
        std::fs::create_dir_all(fixture.join("res/xml")).unwrap();
        std::fs::write(fixture.join("AndroidManifest.xml"), manifest).unwrap();
        if let Some(config) = network_config {
            std::fs::write(fixture.join("res/xml/network_security_config.xml"), config).unwrap();
        }
    }

    pub fn write_package(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("AndroidManifest.xml", options).unwrap();
        zip.write_all(b"binary manifest").unwrap();
        zip.start_file("classes.dex", options).unwrap();
        zip.write_all(b"dex\n035").unwrap();
        zip.finish().unwrap();
        path
    }

    pub fn package(&self) -> PathBuf {
        self.path("app.apk")
    }

    pub fn keystore(&self) -> PathBuf {
        self.path("release.jks")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path("out")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.path("work")
    }

    pub fn calls(&self) -> String {
        std::fs::read_to_string(self.path("calls.log")).unwrap_or_default()
    }

    /// A fake tool run as `sh <script>`; every invocation is appended to
    /// `calls.log`.
    pub fn script(&self, name: &str, body: &str) -> Tool {
        let script = self.path("bin").join(name);
        let log = self.path("calls.log");
        std::fs::write(
            &script,
            format!("echo \"{} $*\" >> \"{}\"\n{}\n", name, log.display(), body),
        )
        .unwrap();
        Tool::with_args("sh", [script])
    }

    pub fn apktool(&self) -> Tool {
        let fixture = self.path("fixture");
        self.script(
            "apktool",
            &format!(
                r#"case "$1" in
  d) mkdir -p "$5" && cp -R "{}/." "$5" ;;
  b) cat "$2/AndroidManifest.xml" "$2"/res/xml/*.xml > "$4" 2>/dev/null || cat "$2/AndroidManifest.xml" > "$4" ;;
esac"#,
                fixture.display()
            ),
        )
    }

    pub fn zipalign(&self) -> Tool {
        self.script("zipalign", r#"cp "$3" "$4""#)
    }

    pub fn apksigner(&self) -> Tool {
        self.script(
            "apksigner",
            r#"case "$1" in
  sign) for last; do :; done; echo SIGNED >> "$last" ;;
  verify) grep -q SIGNED "$3" || { echo "DOES NOT VERIFY" >&2; exit 1; } ;;
esac"#,
        )
    }

    pub fn failing(&self, name: &str, message: &str) -> Tool {
        self.script(name, &format!("echo \"{}\" >&2\nexit 1", message))
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::from_tools(
            self.apktool(),
            self.zipalign(),
            self.apksigner(),
            Tool::new("keytool"),
        )
    }

    pub fn config(&self, zipalign: bool, debuggable: bool) -> RunConfig {
        RunConfig {
            zipalign_enabled: zipalign,
            debuggable_enabled: debuggable,
            output_dir: self.output_dir(),
            workspace_root: Some(self.workspace_root()),
            ..RunConfig::default()
        }
    }

    pub fn credential(&self) -> SigningCredential {
        SigningCredential {
            keystore: self.keystore(),
            keystore_password: "storepass".into(),
            key_alias: "release".into(),
            key_password: "keypass".into(),
        }
    }
}

pub fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

pub fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
