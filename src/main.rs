// SPDX-License-Identifier: MIT

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use kinetic_flow::flow::{CheckpointStore, FileCheckpointStore, RunId};
use kinetic_flow::kinetic::config::Settings;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file; defaults plus KINETIC_* overrides when omitted
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the checkpoint history of a run
    Checkpoints {
        run_id: String,

        /// Checkpoint directory, overriding the settings
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Print the latest checkpoint of a run as JSON
    Show {
        run_id: String,

        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Print the resolved settings
    Config,
}

fn load_settings(file: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let settings = match file {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    Ok(settings.with_env()?)
}

fn open_store(settings: &Settings, dir: Option<PathBuf>) -> anyhow::Result<FileCheckpointStore> {
    let dir = dir.unwrap_or_else(|| settings.checkpoint_dir.clone());
    log::debug!("Opening checkpoint store at {}", dir.display());
    Ok(FileCheckpointStore::new(&dir)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let settings = load_settings(args.file.as_ref())?;

    match args.command {
        Commands::Checkpoints { run_id, dir } => {
            let store = open_store(&settings, dir)?;
            let run_id = RunId::from(run_id);
            let history = store.history(&run_id).await?;
            if history.is_empty() {
                bail!("no checkpoints for run {}", run_id);
            }
            for cp in history {
                println!(
                    "{:>4}  {}  {:<9}  {}",
                    cp.sequence,
                    cp.created_at.to_rfc3339(),
                    cp.status.as_str(),
                    cp.active_checkpoint.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Show { run_id, dir } => {
            let store = open_store(&settings, dir)?;
            let run_id = RunId::from(run_id);
            match store.latest(&run_id).await? {
                Some(cp) => println!("{}", cp.to_json_pretty()?),
                None => bail!("no checkpoints for run {}", run_id),
            }
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&settings)?);
        }
    }

    Ok(())
}
