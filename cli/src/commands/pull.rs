//! `regmirror pull` command.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use regmirror_core::config::{Platform, PullConfig, DEFAULT_DATA_DIR, DEFAULT_MAX_PULL_PROCS};
use regmirror_engine::auth::AuthResolver;
use regmirror_engine::saver::ImageSaver;

use crate::images;

/// Where the image list comes from.
#[derive(Subcommand)]
pub enum PullSource {
    /// Read image references from a plain text file, one per line
    Raw {
        /// Path to the image list file
        #[arg(short, long)]
        file: PathBuf,

        #[command(flatten)]
        opts: PullOpts,
    },
    /// Scan Kubernetes yaml manifests for `image:` fields
    Yaml {
        /// Yaml file or directory to scan recursively
        #[arg(short, long)]
        path: PathBuf,

        #[command(flatten)]
        opts: PullOpts,
    },
    /// Pull image references given on the command line
    Default {
        /// Image references (comma-separated or repeated)
        #[arg(long, num_args = 1.., value_delimiter = ',', required = true)]
        images: Vec<String>,

        #[command(flatten)]
        opts: PullOpts,
    },
}

/// Flags shared by every pull source.
#[derive(Args)]
pub struct PullOpts {
    /// Target architecture for multi-arch images
    #[arg(short, long, default_value = "amd64")]
    pub arch: String,

    /// Registry storage root (must already exist)
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Registry credentials, "address=<host>&&auth=<base64(user:pass)>"
    #[arg(long = "auths")]
    pub auths: Vec<String>,

    /// Maximum number of images pulled concurrently
    #[arg(long, default_value_t = DEFAULT_MAX_PULL_PROCS)]
    pub max_pull_procs: usize,

    /// Send basic auth on every request instead of bearer token exchange
    #[arg(long)]
    pub basic_auth: bool,
}

pub async fn execute(source: PullSource) -> Result<(), Box<dyn std::error::Error>> {
    let (images, opts) = match source {
        PullSource::Raw { file, opts } => (images::read_image_list(&file)?, opts),
        PullSource::Yaml { path, opts } => (images::collect_yaml_images(&path)?, opts),
        PullSource::Default { images, opts } => (images, opts),
    };

    let config = PullConfig {
        platform: Platform::linux(opts.arch.as_str()),
        data_dir: opts.data_dir,
        max_pull_procs: opts.max_pull_procs,
        basic_auth: opts.basic_auth,
    };
    config.validate()?;
    let resolver = AuthResolver::from_entries(&opts.auths)?;

    println!("Pulling {} image(s) to {}...", images.len(), config.data_dir.display());
    let saver = ImageSaver::new(&config, resolver);
    let report = saver
        .save_images(&images, &config.data_dir, &config.platform)
        .await?;

    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("Pulled: {}", outcome.reference),
            Some(error) => println!("Failed: {} ({})", outcome.reference, error),
        }
    }

    if report.all_succeeded() {
        println!("Done: {} image(s) pulled", report.succeeded());
        Ok(())
    } else {
        Err(format!(
            "{} of {} image(s) failed to pull",
            report.failed(),
            report.outcomes.len()
        )
        .into())
    }
}
