//! zdfs CLI - prepare and inspect overlaybd layer configs

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zdfs::{descriptor, Config, LayerDir, Preparer, SnapshotInfo, StaticParents};

#[derive(Parser)]
#[command(name = "zdfs")]
#[command(about = "overlaybd backing-store config synthesis for containerd snapshots")]
#[command(version)]
struct Cli {
    /// settings file (toml)
    #[arg(short, long, env = "ZDFS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// prepare the layer chain of a snapshot
    Prepare {
        /// snapshotter root holding snapshots/<id>
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// snapshot key
        #[arg(short, long)]
        key: String,

        /// id of the snapshot being activated
        id: String,

        /// ancestor ids, immediate parent first
        #[arg(short, long, value_delimiter = ',')]
        parents: Vec<String>,
    },

    /// check whether a directory is an overlaybd layer
    Probe {
        /// layer directory
        dir: PathBuf,
    },

    /// print the blob listing url of an image reference
    BlobUrl {
        /// image reference, e.g. registry.example.com/repo/name:tag
        image_ref: String,
    },

    /// print the backing-store config of a layer
    Show {
        /// layer directory
        dir: PathBuf,
    },

    /// migrate the legacy meta files of a layer
    Migrate {
        /// layer directory
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> zdfs::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Prepare {
            root,
            key,
            id,
            parents,
        } => {
            if root.is_some() {
                config.snapshots_dir = root;
            }
            let resolver = StaticParents::new().with(key.clone(), parents);
            let info = SnapshotInfo {
                name: key.clone(),
                ..Default::default()
            };

            let preparer = Preparer::new(config);
            let sn_path = |id: &str| preparer.config().snapshot_path(id);
            let handled = preparer.prepare_backing_store_spec(
                &key,
                &id,
                &sn_path(&id),
                &info,
                &resolver,
                sn_path,
            )?;
            if handled {
                println!("prepared {}", key);
            } else {
                println!("{} is not an overlaybd snapshot", key);
            }
        }

        Commands::Probe { dir } => {
            let layer = LayerDir::new(dir);
            println!("{}", zdfs::is_overlaybd_layer(&layer)?);
        }

        Commands::BlobUrl { image_ref } => {
            println!("{}", zdfs::image_blob_url(&image_ref)?);
        }

        Commands::Show { dir } => {
            let layer = LayerDir::new(dir);
            let bs_config = descriptor::load(&layer)?;
            println!("repoBlobUrl {}", bs_config.repo_blob_url);
            println!("resultFile {}", bs_config.result_file);
            if !bs_config.record_trace_path.is_empty() {
                println!("recordTracePath {}", bs_config.record_trace_path);
            }
            for lower in &bs_config.lowers {
                if lower.file.is_empty() {
                    println!("lower {} {} {}", lower.digest, lower.size, lower.dir);
                } else {
                    println!("lower file {}", lower.file);
                }
            }
        }

        Commands::Migrate { dir } => {
            let layer = LayerDir::new(dir);
            let preparer = Preparer::new(config);
            let _guard = preparer.lock()?;
            zdfs::migrate_layer(&layer)?;
            println!("migrated {}", layer.path().display());
        }
    }

    Ok(())
}
