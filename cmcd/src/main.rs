//! CMC daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use attestation_report::{Measurer, PolicyEngineSelect, Serializer, Signer};
use cmcd::{load_metadata, Server, ServerConfig};
use sw_driver::SwDriver;
use tpm_cmd::IkAlg;
use tpm_driver::TpmDriver;

#[derive(Parser, Debug)]
#[command(name = "cmcd", about = "CMC attestation daemon")]
struct Args {
    /// Address the service listens on.
    #[arg(long, default_value = "127.0.0.1:9955")]
    cmc_addr: String,

    /// Report serializer: json or cbor.
    #[arg(long, default_value = "json")]
    serializer: String,

    /// Key store directory.
    #[arg(long, default_value = "/var/lib/cmcd")]
    storage: PathBuf,

    /// Directory with signed metadata (manifests, descriptions).
    #[arg(long)]
    metadata_dir: Option<PathBuf>,

    /// Enrollment server base URL, used when provisioning is required.
    #[arg(long, default_value = "https://127.0.0.1:9000")]
    prov_server: String,

    /// Identity key algorithm: EC256, EC384, EC521, RSA2048 or RSA4096.
    #[arg(long, default_value = "EC256")]
    key_config: String,

    /// Include the IMA measurement list in reports.
    #[arg(long)]
    use_ima: bool,

    /// PCR the kernel IMA log extends into.
    #[arg(long, default_value_t = 10)]
    ima_pcr: u32,

    /// Measurement driver: tpm or sw.
    #[arg(long, default_value = "tpm")]
    driver: String,

    /// Policy engine: none or checks.
    #[arg(long, default_value = "none")]
    policy_engine: String,

    /// TPM device path override.
    #[arg(long)]
    tpm_device: Option<String>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let serializer: Serializer = args.serializer.parse()?;
    let policy_engine: PolicyEngineSelect = args.policy_engine.parse()?;

    let metadata = match &args.metadata_dir {
        Some(dir) => load_metadata(dir)?,
        None => Vec::new(),
    };

    let (metadata, measurers, signer): (Vec<Vec<u8>>, Vec<Box<dyn Measurer>>, Arc<dyn Signer>) =
        match args.driver.as_str() {
            "tpm" => {
                if metadata.is_empty() {
                    bail!("the TPM driver requires --metadata-dir");
                }
                let driver = TpmDriver::new(&tpm_driver::Config {
                    storage_path: args.storage.clone(),
                    server_addr: args.prov_server.clone(),
                    key_config: args.key_config.parse::<IkAlg>()?,
                    metadata: metadata.clone(),
                    use_ima: args.use_ima,
                    ima_pcr: args.ima_pcr,
                    serializer,
                    tpm_device: args.tpm_device.clone(),
                })
                .context("failed to initialize TPM driver")?;
                let driver = Arc::new(driver);
                (
                    metadata,
                    vec![Box::new(driver.clone()) as Box<dyn Measurer>],
                    driver,
                )
            }
            "sw" => {
                let driver = Arc::new(SwDriver::new()?);
                let metadata = if metadata.is_empty() {
                    info!("no metadata directory given, using software driver manifests");
                    driver.manifests(serializer)?
                } else {
                    metadata
                };
                (
                    metadata,
                    vec![Box::new(driver.clone()) as Box<dyn Measurer>],
                    driver,
                )
            }
            other => bail!("unknown driver: {other}"),
        };

    let server = Server::bind(
        &args.cmc_addr,
        ServerConfig {
            metadata,
            measurers,
            signer,
            serializer,
            policy_engine,
        },
    )?;
    server.serve()
}
