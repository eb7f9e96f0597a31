//! raidpir-mirror — serves XOR blocks to RAID-PIR clients and advertises
//! itself to the vendor.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use raidpir_core::fetch;
use raidpir_core::manifest::Manifest;
use raidpir_core::wire::MirrorInfo;
use raidpir_core::{DEFAULT_MIRROR_PORT, DEFAULT_VENDOR_PORT};
use raidpir_store::populate::populate_from_files;
use raidpir_store::XorDatastore;

use raidpir_mirror::{advertise, MirrorService};

#[derive(Parser, Debug)]
#[command(
    name = "raidpir-mirror",
    about = "RAID-PIR mirror server",
    version = raidpir_core::PIR_VERSION
)]
struct Options {
    /// IP to listen on and advertise to the vendor.
    #[arg(long = "ip", default_value = "127.0.0.1")]
    ip: String,

    /// Port to serve RAID-PIR clients on.
    #[arg(long = "port", default_value_t = DEFAULT_MIRROR_PORT)]
    port: u16,

    /// The base directory where all mirror files are located (RAM backend).
    #[arg(short = 'f', long = "files", value_name = "DIR")]
    files: Option<PathBuf>,

    /// Read this consolidated database file (memory-mapped backend).
    #[arg(short = 'd', long = "database", value_name = "FILE")]
    database: Option<PathBuf>,

    /// The manifest file to use.
    #[arg(short = 'm', long = "manifestfile", default_value = "manifest.dat")]
    manifest_file: PathBuf,

    /// Retrieve the manifest from this vendor before starting.
    #[arg(long = "retrievemanifestfrom", value_name = "IP:PORT")]
    retrieve_manifest_from: Option<String>,

    /// Seconds between vendor advertisements.
    #[arg(long = "announcedelay", default_value_t = 60)]
    announce_delay: u64,

    /// Build the four-Russians table to speed up PIR responses.
    #[arg(long = "precompute")]
    precompute: bool,

    /// Vendor IP, overriding the value from the manifest.
    #[arg(long = "vendorip", value_name = "IP")]
    vendor_ip: Option<String>,

    /// Write log output to this file instead of stderr.
    #[arg(long = "logfile", value_name = "FILE")]
    logfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    init_tracing(options.logfile.as_deref())?;

    if options.files.is_some() == options.database.is_some() {
        bail!("must specify either --files or --database");
    }
    if options.announce_delay == 0 {
        bail!("announce delay must be positive");
    }

    let manifest = load_manifest(&options).await?;
    tracing::info!(
        blocks = manifest.block_count,
        block_size = manifest.block_size,
        files = manifest.files.len(),
        "manifest loaded"
    );

    let mut store = build_datastore(&options, &manifest)?;
    if options.precompute {
        tracing::info!("building four-Russians table");
        store.finalize();
    }

    let listener = TcpListener::bind((options.ip.as_str(), options.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", options.ip, options.port))?;
    tracing::info!(ip = %options.ip, port = options.port, "mirror server started");

    let service = MirrorService::new(store);

    let my_info = MirrorInfo {
        ip: options.ip.clone(),
        port: options.port,
    };
    let vendor_location = options
        .vendor_ip
        .clone()
        .unwrap_or_else(|| format!("{}:{}", manifest.vendor_hostname, manifest.vendor_port));
    let advertise_task = tokio::spawn(advertise::advertise_loop(
        my_info,
        vendor_location,
        DEFAULT_VENDOR_PORT,
        Duration::from_secs(options.announce_delay),
    ));

    let serve_task = tokio::spawn(service.serve(listener));

    tokio::select! {
        result = serve_task => bail!("mirror accept loop exited: {result:?}"),
        result = advertise_task => bail!("advertise loop exited: {result:?}"),
    }
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

async fn load_manifest(options: &Options) -> Result<Manifest> {
    if let Some(vendor) = &options.retrieve_manifest_from {
        let raw = fetch::retrieve_raw_manifest(vendor, DEFAULT_VENDOR_PORT)
            .await
            .context("cannot retrieve the manifest")?;
        let manifest = Manifest::parse(&raw).context("vendor sent a corrupt manifest")?;
        std::fs::write(&options.manifest_file, &raw).with_context(|| {
            format!("cannot store manifest at {}", options.manifest_file.display())
        })?;
        Ok(manifest)
    } else {
        let raw = std::fs::read(&options.manifest_file).with_context(|| {
            format!("cannot read manifest {}", options.manifest_file.display())
        })?;
        Ok(Manifest::parse(&raw)?)
    }
}

fn build_datastore(options: &Options, manifest: &Manifest) -> Result<XorDatastore> {
    if let Some(database) = &options.database {
        tracing::info!(path = %database.display(), "using mmap datastore");
        Ok(XorDatastore::open_mmap(
            manifest.block_size,
            manifest.block_count,
            database,
        )?)
    } else {
        let files = options.files.as_ref().expect("checked in main");
        tracing::info!(path = %files.display(), "loading data into RAM datastore");
        let started = std::time::Instant::now();
        let mut store = XorDatastore::new_ram(manifest.block_size, manifest.block_count)?;
        populate_from_files(manifest, &mut store, files)?;
        tracing::info!(elapsed = ?started.elapsed(), "datastore initialized");
        Ok(store)
    }
}
