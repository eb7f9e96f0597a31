//! raidpir-vendor — serves the manifest and the live mirror list.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use raidpir_core::manifest::Manifest;
use raidpir_vendor::{MirrorRegistry, VendorService};

#[derive(Parser, Debug)]
#[command(
    name = "raidpir-vendor",
    about = "RAID-PIR vendor server",
    version = raidpir_core::PIR_VERSION
)]
struct Options {
    /// The manifest file to serve.
    #[arg(short = 'm', long = "manifestfile", default_value = "manifest.dat")]
    manifest_file: PathBuf,

    /// IP to listen on (default: from the manifest).
    #[arg(long = "ip")]
    ip: Option<String>,

    /// Port to listen on (default: from the manifest).
    #[arg(long = "port")]
    port: Option<u16>,

    /// Write log output to this file instead of stderr.
    #[arg(long = "logfile", value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// The maximum serialized size a mirror may advertise with.
    #[arg(long = "maxmirrorinfo", default_value_t = 10240)]
    max_mirror_info: usize,

    /// Seconds of silence before a mirror is expired.
    #[arg(long = "mirrorexpirytime", default_value_t = 300)]
    mirror_expiry_time: u64,

    /// Require advertisements to come from the advertised IP.
    #[arg(long = "checkmirrorip")]
    check_mirror_ip: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    init_tracing(options.logfile.as_deref())?;

    if options.max_mirror_info == 0 {
        bail!("max mirror info size must be positive");
    }

    let raw_manifest = std::fs::read(&options.manifest_file).with_context(|| {
        format!("cannot read manifest {}", options.manifest_file.display())
    })?;
    // parsed only for the sanity / corruption check; clients get the raw bytes
    let manifest = Manifest::parse(&raw_manifest).context("manifest is corrupt")?;

    let ip = options
        .ip
        .clone()
        .unwrap_or_else(|| manifest.vendor_hostname.clone());
    let port = options.port.unwrap_or(manifest.vendor_port);

    let listener = TcpListener::bind((ip.as_str(), port))
        .await
        .with_context(|| format!("cannot listen on {ip}:{port}"))?;
    tracing::info!(%ip, port, "vendor server started");

    let service = VendorService::new(
        raw_manifest,
        MirrorRegistry::new(Duration::from_secs(options.mirror_expiry_time)),
        options.max_mirror_info,
        options.check_mirror_ip,
    );
    service.serve(listener).await;
    bail!("vendor accept loop exited")
}

fn init_tracing(logfile: Option<&std::path::Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
