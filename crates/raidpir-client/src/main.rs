//! raidpir-client — retrieve files privately from RAID-PIR mirrors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use raidpir_client::{build_plan, retrieve_blocks};
use raidpir_core::fetch;
use raidpir_core::manifest::Manifest;
use raidpir_core::DEFAULT_VENDOR_PORT;

#[derive(Parser, Debug)]
#[command(
    name = "raidpir-client",
    about = "Privately retrieve files from RAID-PIR mirrors",
    version = raidpir_core::PIR_VERSION
)]
struct Options {
    /// Retrieve the manifest from this vendor (IP or IP:port) and store it
    /// at the manifest file path.
    #[arg(long = "retrievemanifestfrom", value_name = "IP:PORT")]
    retrieve_manifest_from: Option<String>,

    /// The manifest file to use.
    #[arg(short = 'm', long = "manifestfile", default_value = "manifest.dat")]
    manifest_file: PathBuf,

    /// How many mirrors to query.
    #[arg(short = 'k', long = "numberofmirrors", default_value_t = 2)]
    k: usize,

    /// Activate chunked queries with this redundancy (how often chunks
    /// overlap across mirrors).
    #[arg(short = 'r', long = "redundancy")]
    redundancy: Option<usize>,

    /// Derive secondary chunks from a seeded RNG instead of sending them.
    /// Requires -r.
    #[arg(short = 'R', long = "rng")]
    rng: bool,

    /// Query one block per chunk in parallel. Requires -r and -R.
    #[arg(short = 'p', long = "parallel")]
    parallel: bool,

    /// Vendor IP, overriding the value from the manifest.
    #[arg(long = "vendorip", value_name = "IP")]
    vendor_ip: Option<String>,

    /// Print the files available in the manifest.
    #[arg(long = "printfilenames")]
    print_filenames: bool,

    /// Files to retrieve.
    #[arg(value_name = "FILE")]
    files: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(err) => {
            // clap's own help/version output is not an error
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(1);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    if let Err(err) = validate_options(&options) {
        eprintln!("{err}");
        return ExitCode::from(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    match runtime.block_on(run(options)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn validate_options(options: &Options) -> Result<()> {
    if options.k < 2 {
        bail!("mirrors to contact must be > 1");
    }
    if let Some(r) = options.redundancy {
        if r < 2 {
            bail!("redundancy must be > 1");
        }
        if r > options.k {
            bail!("redundancy must be less or equal to number of mirrors ({})", options.k);
        }
    } else if options.rng || options.parallel {
        bail!("chunks must be enabled and redundancy set (-r <number>) to use RNG or parallel queries");
    }
    if options.files.is_empty() && !options.print_filenames {
        bail!("must specify at least one file to retrieve");
    }
    Ok(())
}

async fn run(options: Options) -> Result<ExitCode> {
    let manifest = load_manifest(&options).await?;

    if options.print_filenames {
        println!(
            "Manifest - Blocks: {} x {} Byte - Files:",
            manifest.block_count, manifest.block_size
        );
        for name in manifest.file_names() {
            println!("  {name}");
        }
    }

    // ensure the requested files are in the release before doing any work
    for filename in &options.files {
        if manifest.file_info(filename).is_none() {
            eprintln!("the file {filename} is not listed in the manifest");
            return Ok(ExitCode::from(2));
        }
    }
    if options.files.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    // the blocks we need, deduplicated but in first-use order
    let mut needed: Vec<usize> = Vec::new();
    for filename in &options.files {
        for block in manifest.blocks_for_file(filename)? {
            if !needed.contains(&block) {
                needed.push(block);
            }
        }
    }
    tracing::info!(blocks = needed.len(), files = options.files.len(), "retrieving");

    let vendor_location = options
        .vendor_ip
        .clone()
        .unwrap_or_else(|| format!("{}:{}", manifest.vendor_hostname, manifest.vendor_port));
    let mirrors = fetch::retrieve_mirror_list(&vendor_location, DEFAULT_VENDOR_PORT)
        .await
        .context("cannot retrieve the mirror list")?;
    tracing::info!(mirrors = mirrors.len(), "mirror list retrieved");

    let plan = build_plan(
        &needed,
        manifest.block_count,
        options.k,
        options.redundancy,
        options.rng,
        options.parallel,
        false,
        &mut rand::thread_rng(),
    )?;

    let manifest = Arc::new(manifest);
    let blocks: HashMap<usize, Vec<u8>> =
        retrieve_blocks(plan, manifest.clone(), mirrors).await?;

    for filename in &options.files {
        let data = manifest.extract_file(filename, &blocks)?;
        let info = manifest.file_info(filename).expect("checked above");
        if !manifest.hash_algorithm.verify(&data, &info.hash) {
            bail!("corrupt manifest has incorrect file hash despite passing block hash checks");
        }
        // write under the basename, like any other download
        let basename = std::path::Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());
        std::fs::write(&basename, &data)
            .with_context(|| format!("cannot write {basename}"))?;
        println!("wrote {basename}");
    }

    Ok(ExitCode::SUCCESS)
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
        tracing::info!(path = %options.manifest_file.display(), "manifest retrieved and stored");
        Ok(manifest)
    } else {
        let raw = std::fs::read(&options.manifest_file).with_context(|| {
            format!("cannot read manifest {}", options.manifest_file.display())
        })?;
        Ok(Manifest::parse(&raw)?)
    }
}
