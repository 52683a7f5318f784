use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use trustpatch::{
    AliasResolver, AppDirs, ConfigStore, CredentialStore, Error, Outcome, Pipeline,
    PipelineRequest, RunController, SigningCredential, Toolchain,
};

const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "trustpatch")]
#[command(about = "Make an Android package trust user-installed CA certificates and re-sign it")]
#[command(version)]
struct Cli {
    /// Directory holding app_config.json, last_paths.json and tools.toml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch, repack, sign and verify a package
    Patch {
        /// Package to patch
        apk: PathBuf,
        /// Keystore holding the signing key
        #[arg(long)]
        keystore: Option<PathBuf>,
        /// Keystore password
        #[arg(long)]
        storepass: Option<String>,
        /// Key alias inside the keystore
        #[arg(long)]
        alias: Option<String>,
        /// Key password
        #[arg(long)]
        keypass: Option<String>,
        /// Reuse a previously unpacked workspace if one exists
        #[arg(long)]
        skip_decompile: bool,
        /// Leave the workspace on disk afterwards
        #[arg(long)]
        keep_workspace: bool,
    },
    /// List the key aliases in a keystore
    Aliases {
        #[arg(long)]
        keystore: Option<PathBuf>,
        #[arg(long)]
        storepass: Option<String>,
    },
    /// Show or change the run configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show or clear remembered signing credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
    /// Check that every external tool can be found
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum CredentialsAction {
    Show,
    Forget,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("TRUSTPATCH_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let dirs = match cli.config_dir {
        Some(dir) => AppDirs::new(dir),
        None => AppDirs::from_home()?,
    };

    match cli.command {
        Commands::Patch {
            apk,
            keystore,
            storepass,
            alias,
            keypass,
            skip_decompile,
            keep_workspace,
        } => {
            let supplied = SuppliedCredential {
                keystore,
                storepass,
                alias,
                keypass,
            };
            patch_package(&dirs, apk, supplied, skip_decompile, keep_workspace).await
        }
        Commands::Aliases { keystore, storepass } => {
            list_aliases(&dirs, keystore, storepass).await
        }
        Commands::Config { action } => configure(&dirs, action),
        Commands::Credentials { action } => manage_credentials(&dirs, action),
        Commands::Doctor => doctor(&dirs),
    }
}

struct SuppliedCredential {
    keystore: Option<PathBuf>,
    storepass: Option<String>,
    alias: Option<String>,
    keypass: Option<String>,
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, Error> {
    value.ok_or_else(|| Error::Input(format!("{} is required", field)))
}

async fn patch_package(
    dirs: &AppDirs,
    apk: PathBuf,
    supplied: SuppliedCredential,
    skip_decompile: bool,
    keep_workspace: bool,
) -> anyhow::Result<i32> {
    let mut credentials = CredentialStore::new(dirs.state_file());
    let effective = credentials.get_effective_credential();

    let keystore = require(
        supplied
            .keystore
            .or_else(|| non_empty(effective.keystore_path).map(PathBuf::from)),
        "keystore",
    )?;
    let keystore_password = require(
        supplied.storepass.or_else(|| non_empty(effective.keystore_password)),
        "keystore password",
    )?;
    let key_alias = match supplied.alias.or_else(|| non_empty(effective.key_alias)) {
        Some(alias) => alias,
        None => pick_alias(dirs, &mut credentials, &keystore, &keystore_password).await?,
    };
    let credential = SigningCredential {
        keystore,
        keystore_password,
        key_alias,
        key_password: require(
            supplied.keypass.or_else(|| non_empty(effective.key_password)),
            "key password",
        )?,
    };

    if let Err(e) = credentials.remember_entered(&apk, &credential.to_tuple()) {
        warn!("could not remember entered credentials: {}", e);
    }

    let mut config = ConfigStore::load(dirs.config_file()).config().clone();
    config.keep_workspace |= keep_workspace;
    let skip_decompile = skip_decompile || config.skip_decompile_enabled;

    let overrides = dirs.load_tool_overrides()?;
    let toolchain = Toolchain::discover(&overrides, &dirs.tools_dir())
        .context("Could not locate the Android build tools (run 'trustpatch doctor')")?;

    println!("🔧 Patching {}", apk.display());
    let controller = RunController::new(Pipeline::new(toolchain, config));
    let mut handle = controller.start(PipelineRequest {
        package: apk,
        credential: credential.clone(),
        skip_decompile,
    })?;

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⏹️  Cancelling after the current step finishes...");
            cancel.cancel();
        }
    });

    while let Some(line) = handle.next_progress().await {
        println!("[{}] {}", Local::now().format("%H:%M:%S"), line);
    }

    let outcome = handle.wait().await;
    match &outcome {
        Outcome::Succeeded { artifact } => {
            if let Err(e) = credentials.save_last_success(&credential.to_tuple()) {
                warn!("could not save credentials: {}", e);
            }
            println!("✅ Done: {}", artifact.display());
            Ok(0)
        }
        Outcome::Cancelled { .. } => {
            println!("⏹️  {}", outcome);
            Ok(EXIT_CANCELLED)
        }
        Outcome::Failed { error, .. } => {
            eprintln!("❌ {}", outcome);
            if let Some(diagnostic) = error.diagnostic().filter(|d| !d.trim().is_empty()) {
                eprintln!("{}", diagnostic.trim_end());
            }
            Ok(EXIT_FAILURE)
        }
    }
}

/// No alias was given or remembered: list the keystore and take the
/// startup choice.
async fn pick_alias(
    dirs: &AppDirs,
    credentials: &mut CredentialStore,
    keystore: &Path,
    storepass: &str,
) -> anyhow::Result<String> {
    let keytool = Toolchain::discover_keytool(&dirs.load_tool_overrides()?)?;
    let report = credentials
        .resolve_aliases(&AliasResolver::new(keytool), keystore, storepass)
        .await;
    if let Some(error) = report.messages.iter().find(|m| m.is_error()) {
        return Err(Error::Input(format!("cannot choose a key alias: {}", error)).into());
    }

    let (chosen, messages) = credentials.choose_alias_for_startup(&report.aliases);
    for message in messages {
        println!("🔑 {}", message);
    }
    Ok(require(chosen, "key alias")?)
}

async fn list_aliases(
    dirs: &AppDirs,
    keystore: Option<PathBuf>,
    storepass: Option<String>,
) -> anyhow::Result<i32> {
    let mut credentials = CredentialStore::new(dirs.state_file());
    let startup = keystore.is_none() && storepass.is_none();

    let (keystore, storepass) = if startup {
        let effective = credentials.get_effective_credential();
        let (path, password) = (&effective.keystore_path, &effective.keystore_password);
        if !credentials.should_auto_resolve(path, password) {
            bail!("No remembered keystore and password; pass --keystore and --storepass");
        }
        (PathBuf::from(effective.keystore_path), effective.keystore_password)
    } else {
        let keystore = require(keystore, "keystore")?;
        credentials.remember_keystore(&keystore)?;
        (keystore, storepass.unwrap_or_default())
    };

    let keytool = Toolchain::discover_keytool(&dirs.load_tool_overrides()?)?;
    let report = credentials
        .resolve_aliases(&AliasResolver::new(keytool), &keystore, &storepass)
        .await;

    for message in &report.messages {
        if message.is_error() {
            eprintln!("❌ {}", message);
        } else {
            println!("💡 {}", message);
        }
    }
    if report.messages.iter().any(|m| m.is_error()) {
        return Ok(EXIT_FAILURE);
    }

    for alias in &report.aliases {
        println!("  {}", alias);
    }

    if startup {
        let (chosen, messages) = credentials.choose_alias_for_startup(&report.aliases);
        for message in messages {
            println!("🔑 {}", message);
        }
        if let Some(alias) = chosen {
            credentials.persist_key_alias(&alias)?;
        }
    }
    Ok(0)
}

fn configure(dirs: &AppDirs, action: ConfigAction) -> anyhow::Result<i32> {
    let mut store = ConfigStore::load(dirs.config_file());
    match action {
        ConfigAction::Show => {
            println!("📄 {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(store.config())?);
            println!("workspace root: {}", store.config().workspace_root().display());
        }
        ConfigAction::Set { key, value } => {
            store.set(&key, &value)?;
            println!("✅ {} = {}", key, value);
        }
    }
    Ok(0)
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(none)"
    } else {
        "****"
    }
}

fn manage_credentials(dirs: &AppDirs, action: CredentialsAction) -> anyhow::Result<i32> {
    let mut credentials = CredentialStore::new(dirs.state_file());
    match action {
        CredentialsAction::Show => {
            let paths = credentials.get_last_paths();
            println!("📄 {}", credentials.path().display());
            println!("package:           {}", paths.apk_path);
            println!("keystore:          {}", paths.cert_path);
            println!("keystore password: {}", mask(&paths.cert_password));
            println!("key alias:         {}", paths.key_alias);
            println!("key password:      {}", mask(&paths.key_password));
            if let Some(last) = &paths.last_success_cert {
                println!("last success:      {} ({})", last.cert_path, last.key_alias);
            }

            let effective = credentials.get_effective_credential();
            println!("effective source:  {}", effective.source);
        }
        CredentialsAction::Forget => {
            credentials.forget()?;
            println!("🗑️  Forgot remembered credentials");
        }
    }
    Ok(0)
}

fn show_tool(name: &str, program: &Path) {
    let marker = if program.exists() { "✅" } else { "❔" };
    println!("{} {:<10} {}", marker, name, program.display());
}

fn doctor(dirs: &AppDirs) -> anyhow::Result<i32> {
    let overrides = dirs.load_tool_overrides()?;
    let toolchain = match Toolchain::discover(&overrides, &dirs.tools_dir()) {
        Ok(toolchain) => toolchain,
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("💡 Set ANDROID_SDK_ROOT or sdk_root in {}", dirs.tools_file().display());
            return Ok(EXIT_FAILURE);
        }
    };

    if let Some(sdk) = &toolchain.sdk {
        println!("📱 Android SDK: {}", sdk.sdk_path.display());
        println!("🔨 Build tools: {}", sdk.build_tools_version);
    }
    println!("🔧 apktool:    {}", toolchain.apktool.describe(&[]));
    show_tool("zipalign", &toolchain.zipalign.program);
    show_tool("apksigner", &toolchain.apksigner.program);
    show_tool("keytool", &toolchain.keytool.program);
    Ok(0)
}
