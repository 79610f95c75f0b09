#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use bidsfit::analysis::{Analysis, RunError};
use bidsfit::engine::OlsEngine;
use bidsfit::entities::Entities;
use bidsfit::first_level::first_level;
use bidsfit::model::Level;
use bidsfit::second_level::{second_level, SplitMapping};
use bidsfit::ttest::ttest;

#[derive(Parser)]
#[command(
    name = "bidsfit",
    about = "Two-level GLM analysis over BIDS neuroimaging datasets",
    long_about = "Fits a declarative analysis model against a BIDS dataset: per-run \
                  first-level GLMs with contrast maps, then group-level aggregation of \
                  those maps. Re-running is safe; existing outputs are skipped."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full two-level pipeline described by a model file
    Run {
        /// Path to the JSON model document
        model: PathBuf,

        /// Root of the raw BIDS dataset
        bids_dir: PathBuf,

        /// Root of the preprocessed derivatives (preproc, brainmask)
        preproc_dir: PathBuf,

        /// Output directory for design sidecars and statistic images
        output_dir: PathBuf,

        /// Restrict the analysis to one subject
        #[arg(long)]
        subject: Option<String>,

        /// Restrict the analysis to one session
        #[arg(long)]
        session: Option<String>,

        /// Restrict the analysis to one task
        #[arg(long)]
        task: Option<String>,
    },

    /// One-sample group t-test over first-level contrast maps
    Ttest {
        /// Path to the JSON model document
        model: PathBuf,

        /// Root of the raw BIDS dataset
        bids_dir: PathBuf,

        /// Root of the preprocessed derivatives (preproc, brainmask)
        preproc_dir: PathBuf,

        /// Directory holding first-level outputs; results land here too
        output_dir: PathBuf,

        /// Restrict to one session
        #[arg(long)]
        session: Option<String>,

        /// Restrict to one task
        #[arg(long)]
        task: Option<String>,

        /// Normalized space of the input images
        #[arg(long)]
        space: Option<String>,
    },
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RunError> {
    let engine = OlsEngine;
    match cli.command {
        Commands::Run {
            model,
            bids_dir,
            preproc_dir,
            output_dir,
            subject,
            session,
            task,
        } => {
            let mut selectors = Entities::new();
            for (key, value) in [("subject", subject), ("session", session), ("task", task)] {
                if let Some(value) = value {
                    selectors.insert(key.to_string(), value);
                }
            }

            let analysis = Analysis::init(&model, &bids_dir, &preproc_dir, selectors)?;
            let mut mapping = SplitMapping::new();
            for block in &analysis.model.blocks {
                match block.level {
                    Level::Run => {
                        let outputs = first_level(&analysis, block, &engine, &output_dir)?;
                        for (contrast, paths) in &outputs {
                            log::info!("contrast '{contrast}': {} statistic images", paths.len());
                        }
                    }
                    _ => {
                        mapping =
                            second_level(&analysis, block, &engine, &output_dir, mapping)?;
                    }
                }
            }
            Ok(())
        }
        Commands::Ttest {
            model,
            bids_dir,
            preproc_dir,
            output_dir,
            session,
            task,
            space,
        } => ttest(
            &model,
            &bids_dir,
            &preproc_dir,
            &output_dir,
            &engine,
            session.as_deref(),
            task.as_deref(),
            space.as_deref(),
        ),
    }
}
