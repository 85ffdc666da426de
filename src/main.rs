/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use minima::{
    clap_args::{self, Commands, RunArgs},
    config::{self, Config},
    summary, thresholds, Collaborators, Mode,
};
use std::fs;
use tracing::{subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may hold RUST_LOG and the ssh details
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(format!("minima={level}")))?;

    match args.command {
        Commands::Search(run_args) => run(Mode::Search, run_args).await,
        Commands::Sweep(run_args) => run(Mode::Sweep, run_args).await,
        Commands::Thresholds { script } => {
            let text = fs::read_to_string(&script)
                .with_context(|| format!("Unable to read {}", script.display()))?;
            summary::print_thresholds(&thresholds::extract(&text));
            Ok(())
        }
        Commands::Init { path } => {
            config::init_config(&path);
            Ok(())
        }
    }
}

async fn run(mode: Mode, args: RunArgs) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(&args.config)?;
    config.apply_overrides(&args.overrides());

    let collaborators = Collaborators::from_config(&config)?;
    minima::run(mode, &config, &args.stacks, &args.script, collaborators).await?;
    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}
