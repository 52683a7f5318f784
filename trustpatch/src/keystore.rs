//! Listing key aliases with `keytool -list`.
//!
//! keytool's output depends on the JVM locale, so each line is tried against
//! a fixed set of independent matchers rather than one format.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::android_sdk::Tool;

const TAMPERED: &str = "Keystore was tampered with, or password was incorrect";
const IO_EXCEPTION: &str = "java.io.IOException";
const JKS_MIGRATION_HINTS: [&str; 2] = [
    "JKS 密钥库使用专用格式",
    "The JKS keystore uses a proprietary format",
];

/// One matcher per accepted line shape, tried in order.
static ALIAS_LINES: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        r"^别名名称: (.+)$",
        r"^Alias name: (.+)$",
        r"^([^,]+),\s*\d{4}年\d{1,2}月\d{1,2}日,\s*PrivateKeyEntry",
        r"^([^,]+),\s*[A-Za-z]+\s+\d{1,2},\s+\d{4},\s*PrivateKeyEntry",
    ]
    .map(|pattern| Regex::new(pattern).expect("valid alias pattern"))
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Error(String),
    Warning(String),
    Info(String),
}

impl Notice {
    pub fn is_error(&self) -> bool {
        matches!(self, Notice::Error(_))
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Error(text) => write!(f, "Error: {}", text),
            Notice::Warning(text) => write!(f, "Warning: {}", text),
            Notice::Info(text) => f.write_str(text),
        }
    }
}

/// Distinct aliases in first-seen order, plus anything worth telling the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasReport {
    pub aliases: Vec<String>,
    pub messages: Vec<Notice>,
}

impl AliasReport {
    fn failed(message: Notice) -> Self {
        Self {
            aliases: Vec::new(),
            messages: vec![message],
        }
    }
}

pub struct AliasResolver {
    keytool: Tool,
}

impl AliasResolver {
    pub fn new(keytool: Tool) -> Self {
        Self { keytool }
    }

    /// List the aliases in `keystore`. Recoverable problems come back as
    /// messages, never as errors.
    pub async fn read_aliases(&self, keystore: &Path, storepass: &str) -> AliasReport {
        if storepass.trim().is_empty() {
            return AliasReport::failed(Notice::Error("enter the keystore password first".into()));
        }

        let args = [
            OsStr::new("-list"),
            OsStr::new("-keystore"),
            keystore.as_os_str(),
            OsStr::new("-storepass"),
            OsStr::new(storepass),
        ];
        let output = match self.keytool.run(args).await {
            Ok(output) => output,
            Err(e) => {
                return AliasReport::failed(Notice::Error(format!(
                    "failed to read key aliases: {}",
                    e
                )));
            }
        };

        let mut text = decode_tool_text(&output.stdout);
        text.push_str(&decode_tool_text(&output.stderr));
        debug!(code = ?output.code, "keytool finished");

        parse_keytool_listing(&text, output.code)
    }
}

/// Decode tool output as UTF-8, retrying as GBK, which is what keytool
/// writes under a Chinese Windows locale.
pub fn decode_tool_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let (text, _, had_errors) = encoding_rs::GBK.decode(bytes);
    if had_errors {
        debug!("keytool output is neither UTF-8 nor GBK, decoding lossily");
        return String::from_utf8_lossy(bytes).replace(char::REPLACEMENT_CHARACTER, "");
    }
    text.into_owned()
}

/// Classify keytool's combined output and collect the aliases it lists.
pub fn parse_keytool_listing(output: &str, exit_code: Option<i32>) -> AliasReport {
    if output.contains(TAMPERED) {
        return AliasReport::failed(Notice::Error(
            "keystore password is incorrect or the keystore is damaged".into(),
        ));
    }
    if output.contains(IO_EXCEPTION) {
        return AliasReport::failed(Notice::Error(
            "could not access the keystore; check the path and permissions".into(),
        ));
    }
    if let Some(code) = exit_code.filter(|code| *code != 0) {
        return AliasReport::failed(Notice::Error(format!(
            "keytool failed with exit code {}",
            code
        )));
    }

    let mut report = AliasReport::default();
    for line in output.lines() {
        let alias = ALIAS_LINES
            .iter()
            .find_map(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim());

        if let Some(alias) = alias {
            if !alias.is_empty() && !report.aliases.iter().any(|a| a == alias) {
                report.aliases.push(alias.to_string());
            }
        }
    }

    if report.aliases.is_empty() {
        report.messages.push(Notice::Warning(
            "no key aliases found; check the keystore file".into(),
        ));
    }

    if JKS_MIGRATION_HINTS.iter().any(|hint| output.contains(hint)) {
        report.messages.push(Notice::Info(
            "keystore uses the proprietary JKS format; migrating to PKCS12 is recommended".into(),
        ));
    }

    report
}
