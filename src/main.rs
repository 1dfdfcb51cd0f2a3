//! Device Registry CA
//!
//! Issues device client certificates signed by a file-backed CA and registers
//! the devices with the device registry.
//!
//! ```bash
//! device-registry-ca init-ca --common-name "Fleet Device CA"
//! device-registry-ca issue sensor-01 --out-dir out/
//! device-registry-ca serve
//! ```
//!
//! Settings come from `config.toml` (or `--config`) with
//! `REGISTRATION_SERVICE_*` environment variables taking precedence.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use device_registry_ca::configs::AppConfig;
use device_registry_ca::generate_device_cert::DeviceCertificateIssuer;
use device_registry_ca::generate_root_ca::{write_ca_files, write_private_file, RsaRootCABuilder};
use device_registry_ca::webserver;
use secrecy::ExposeSecret;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "device-registry-ca", version, about = "Device certificate issuance and registration")]
struct Cli {
    /// TOML configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true, env = "REGISTRATION_SERVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP registration service
    Serve,
    /// Issue a certificate for one device and write `<name>.crt` and `<name>.key`
    Issue {
        name: String,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Create a self-signed device CA at the configured paths
    InitCa {
        #[arg(long, default_value = "Device Registry CA")]
        common_name: String,
        #[arg(long, default_value_t = 3650)]
        validity_days: u32,
        /// Overwrite existing CA files
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Serve => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            runtime.block_on(webserver::serve(config))
        }
        Command::Issue { name, out_dir } => issue(&config, &name, out_dir),
        Command::InitCa {
            common_name,
            validity_days,
            force,
        } => init_ca(&config, common_name, validity_days, force),
    }
}

/// A device name must be a single plain file name to be used under `--out-dir`
fn check_file_stem(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        bail!("device name {name:?} cannot be used as a file name");
    }
    Ok(())
}

fn issue(config: &AppConfig, name: &str, out_dir: PathBuf) -> Result<()> {
    check_file_stem(name)?;
    let issuer = DeviceCertificateIssuer::from_config(config);
    let credentials = issuer
        .issue(name)
        .with_context(|| format!("Failed to issue certificate for {name}"))?;

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let cert_path = out_dir.join(format!("{name}.crt"));
    let key_path = out_dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, credentials.certificate_pem())
        .with_context(|| format!("Failed to write {}", cert_path.display()))?;
    write_private_file(&key_path, credentials.private_key_pem().expose_secret().as_bytes())
        .with_context(|| format!("Failed to write {}", key_path.display()))?;

    tracing::info!(
        device = name,
        serial = credentials.serial_number(),
        certificate = %cert_path.display(),
        key = %key_path.display(),
        "certificate written"
    );
    Ok(())
}

fn init_ca(config: &AppConfig, common_name: String, validity_days: u32, force: bool) -> Result<()> {
    let cert_path = &config.ca.certificate_path;
    let key_path = &config.ca.key_path;
    if !force {
        for path in [cert_path, key_path] {
            if path.exists() {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
        }
    }

    let (key, cert) = RsaRootCABuilder::from_subject(config.certificate.subject_template())
        .subject_common_name(common_name)
        .validity_days(validity_days)
        .build()
        .context("Failed to generate device CA")?;
    write_ca_files(&key, &cert, cert_path, key_path)?;

    tracing::info!(
        certificate = %cert_path.display(),
        key = %key_path.display(),
        "device CA created"
    );
    Ok(())
}
