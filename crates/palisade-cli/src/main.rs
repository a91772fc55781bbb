//! Palisade CLI - publisher keys, package sealing and verification

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use clap::{Parser, Subcommand};
use palisade_core::config::Config;
use palisade_core::signing::{PluginSigner, TrustedKeys};
use palisade_plugins::manifest::PluginMetadata;
use palisade_plugins::package::PluginPackage;
use palisade_plugins::resolver::{DependencyResolver, HostInfo};
use palisade_plugins::store::FsArtifactStore;
use palisade_plugins::verifier::ArtifactVerifier;
use palisade_plugins::versions::VersionManager;
use semver::Version;
use serde_json::{Value, json};
use tracing::{debug, warn};


/// File names written by `keygen`
const SECRET_KEY_FILE: &str = "palisade.key";
const PUBLIC_KEY_FILE: &str = "palisade.pub";

#[derive(Parser)]
#[command(name = "palisade")]
#[command(author, version, about = "Plugin lifecycle and isolation manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a publisher key pair
    Keygen {
        /// Directory to write palisade.key and palisade.pub into
        #[arg(long)]
        out: PathBuf,
    },

    /// Sign a manifest and payload into a package
    Seal {
        /// Manifest JSON (plugin.json)
        #[arg(long)]
        manifest: PathBuf,
        /// Payload file (wasm module, or anything for native entry points)
        #[arg(long)]
        payload: PathBuf,
        /// Secret key file written by `keygen`
        #[arg(long)]
        key: PathBuf,
        /// Where to write the package
        #[arg(long)]
        out: PathBuf,
    },

    /// Verify a package against trusted publisher keys
    Verify {
        package: PathBuf,
        /// Trusted public key (base64); defaults to trust.keys from config
        #[arg(long = "trust")]
        trust: Vec<String>,
    },

    /// Show a package's manifest and how its dependencies resolve here
    Inspect { package: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all configuration values
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `--format json` output stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("palisade=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out } => cmd_keygen(&out, cli.format, cli.quiet),

        Commands::Seal {
            manifest,
            payload,
            key,
            out,
        } => cmd_seal(&manifest, &payload, &key, &out, cli.format),

        Commands::Verify { package, trust } => cmd_verify(&package, &trust, cli.format),

        Commands::Inspect { package } => cmd_inspect(&package, cli.format).await,

        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn cmd_keygen(out: &Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let secret_path = out.join(SECRET_KEY_FILE);
    let public_path = out.join(PUBLIC_KEY_FILE);
    if secret_path.exists() || public_path.exists() {
        bail!(
            "Refusing to overwrite an existing key pair in {}",
            out.display()
        );
    }

    fs::create_dir_all(out)
        .with_context(|| format!("Failed to create key directory: {}", out.display()))?;

    let signer = PluginSigner::generate();
    write_secret(&secret_path, &BASE64_STANDARD.encode(signer.to_bytes()))?;
    let public_key = signer.public_key_base64();
    fs::write(&public_path, format!("{public_key}\n"))
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    debug!(path = %secret_path.display(), "Key pair written");

    let mut text = format!(
        "Public key: {public_key}\nSecret key: {}",
        secret_path.display()
    );
    if !quiet {
        text.push_str("\n\nAdd the public key to trust.keys to accept packages signed with it.");
    }
    emit(
        format,
        &text,
        &json!({
            "public_key": public_key,
            "secret_key_path": secret_path.display().to_string(),
            "public_key_path": public_path.display().to_string(),
        }),
    )
}

#[cfg(unix)]
fn write_secret(path: &Path, contents: &str) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writeln!(file, "{contents}").with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &str) -> anyhow::Result<()> {
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn cmd_seal(
    manifest_path: &Path,
    payload_path: &Path,
    key_path: &Path,
    out: &Path,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let manifest_bytes = fs::read(manifest_path)
        .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;
    let manifest = PluginMetadata::from_json(&manifest_bytes)
        .with_context(|| format!("Invalid manifest: {}", manifest_path.display()))?;

    let payload = fs::read(payload_path)
        .with_context(|| format!("Failed to read payload: {}", payload_path.display()))?;

    let secret = fs::read_to_string(key_path)
        .with_context(|| format!("Failed to read key: {}", key_path.display()))?;
    let signer = PluginSigner::from_base64(&secret)
        .with_context(|| format!("Invalid secret key: {}", key_path.display()))?;

    let package = PluginPackage::seal(manifest, payload, &signer)?;
    let bytes = package
        .to_bytes()
        .context("Failed to serialize package")?;
    fs::write(out, &bytes).with_context(|| format!("Failed to write {}", out.display()))?;

    let manifest = &package.manifest;
    emit(
        format,
        &format!(
            "Sealed {}@{} -> {}\nContent hash: {}\nPackage size: {} bytes",
            manifest.id,
            manifest.version,
            out.display(),
            manifest.content_hash,
            bytes.len()
        ),
        &json!({
            "id": manifest.id,
            "version": manifest.version.to_string(),
            "content_hash": manifest.content_hash,
            "package": out.display().to_string(),
            "size": bytes.len(),
        }),
    )
}

fn cmd_verify(package_path: &Path, trust: &[String], format: OutputFormat) -> anyhow::Result<()> {
    let trusted = if trust.is_empty() {
        let config = Config::load()?;
        TrustedKeys::from_base64(config.trust.keys.as_slice())?
    } else {
        TrustedKeys::from_base64(trust)?
    };
    if trusted.is_empty() {
        warn!("No trusted keys configured; every package will be rejected");
    }

    let bytes = fs::read(package_path)
        .with_context(|| format!("Failed to read package: {}", package_path.display()))?;

    match ArtifactVerifier::new(trusted).verify(&bytes) {
        Ok(artifact) => {
            let manifest = &artifact.metadata;
            emit(
                format,
                &format!(
                    "Verified {}@{}\nPackage digest: sha256:{}",
                    manifest.id,
                    manifest.version,
                    hex::encode(artifact.package_digest)
                ),
                &json!({
                    "verified": true,
                    "id": manifest.id,
                    "version": manifest.version.to_string(),
                    "package_digest": format!("sha256:{}", hex::encode(artifact.package_digest)),
                }),
            )
        }
        Err(e) => {
            if format == OutputFormat::Json {
                emit(
                    format,
                    "",
                    &json!({ "verified": false, "code": e.code(), "error": e.to_string() }),
                )?;
            }
            bail!("Verification failed [{}]: {}", e.code(), e)
        }
    }
}

async fn cmd_inspect(package_path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let bytes = fs::read(package_path)
        .with_context(|| format!("Failed to read package: {}", package_path.display()))?;
    let package = PluginPackage::from_bytes(&bytes)
        .with_context(|| format!("Not a plugin package: {}", package_path.display()))?;
    let manifest = &package.manifest;

    let config = Config::load()?;
    let resolver = Arc::new(DependencyResolver::new(HostInfo {
        api_level: config.host.api_level,
        app_version: Version::parse(&config.host.app_version)
            .context("Invalid host.app_version")?,
    }));
    let verifier = Arc::new(ArtifactVerifier::new(TrustedKeys::from_base64(
        config.trust.keys.as_slice(),
    )?));
    let store = Arc::new(FsArtifactStore::new(config.data_dir()?.join("artifacts")));
    let versions = VersionManager::new(store, verifier, Arc::clone(&resolver));
    let installed = versions.installed_index().await?;

    let resolution = resolver.resolve(&manifest.id, manifest, &installed);

    let api = match manifest.max_api_level {
        Some(max) => format!("{}..={}", manifest.min_api_level, max),
        None => format!("{}+", manifest.min_api_level),
    };
    let permissions: Vec<&str> = manifest.permissions.iter().map(|p| p.as_str()).collect();

    let mut text = vec![
        format!("Plugin:        {}@{} ({})", manifest.id, manifest.version, manifest.name),
        format!("Author:        {}", manifest.author),
        format!("Entry point:   {}", manifest.entry_point),
        format!("API level:     {api}"),
        format!("Permissions:   {}", list_or_none(&permissions)),
        format!(
            "Allowed hosts: {}",
            list_or_none(&manifest.allowed_hosts.iter().map(String::as_str).collect::<Vec<_>>())
        ),
        format!(
            "Payload:       {} bytes, {}",
            package.payload.len(),
            manifest.content_hash
        ),
        format!(
            "Signed by:     {}",
            manifest
                .signature
                .as_ref()
                .map(|s| s.public_key.as_str())
                .unwrap_or("(unsigned)")
        ),
    ];

    if manifest.dependencies.is_empty() {
        text.push("Dependencies:  (none)".to_string());
    } else {
        text.push("Dependencies:".to_string());
        for dep in &manifest.dependencies {
            text.push(format!("  {} {}", dep.id, dep.version_req));
        }
    }

    let resolution_json = match &resolution {
        Ok(graph) => {
            text.push("Load order:".to_string());
            text.extend(graph.to_string().lines().map(|line| format!("  {line}")));
            json!({
                "ok": true,
                "load_order": graph
                    .load_order()
                    .iter()
                    .map(|node| json!({ "id": node.id, "version": node.version.to_string() }))
                    .collect::<Vec<_>>(),
            })
        }
        Err(e) => {
            text.push(format!("Resolution:    [{}] {}", e.code(), e));
            json!({ "ok": false, "code": e.code(), "error": e.to_string() })
        }
    };

    emit(
        format,
        &text.join("\n"),
        &json!({
            "manifest": manifest,
            "payload_size": package.payload.len(),
            "resolution": resolution_json,
        }),
    )
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            let items = config.list()?;
            let text = items
                .iter()
                .map(|(key, value)| format!("{key} = {value}"))
                .collect::<Vec<_>>()
                .join("\n");
            let map: serde_json::Map<String, Value> = items
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            emit(format, &text, &Value::Object(map))?;
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            emit(format, &value, &json!({ "key": key, "value": value }))?;
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                emit(
                    format,
                    &format!("Set {key} = {value}"),
                    &json!({ "key": key, "value": value }),
                )?;
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            emit(
                format,
                &path.display().to_string(),
                &json!({ "path": path.display().to_string() }),
            )?;
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn emit(format: OutputFormat, text: &str, value: &Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{text}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn list_or_none(items: &[&str]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
