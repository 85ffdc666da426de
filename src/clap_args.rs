/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::CliOverrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search the smallest configuration that meets the workload's thresholds
    Search(RunArgs),

    /// Evaluate every configuration of the search grid
    Sweep(RunArgs),

    /// Print the thresholds found in a k6 script
    Thresholds {
        #[arg(short, long)]
        script: PathBuf,
    },

    /// Write an example minima.toml
    Init {
        #[arg(short, long, default_value = "minima.toml")]
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Comma separated list of stacks
    #[arg(long, value_delimiter = ',', required = true)]
    pub stacks: Vec<String>,

    /// k6 script to run against every instance
    #[arg(long)]
    pub script: PathBuf,

    /// Trials per configuration
    #[arg(short, long)]
    pub repetitions: Option<u32>,

    #[arg(short, long, default_value = "minima.toml")]
    pub config: PathBuf,

    /// Directory for trial records and search journals
    #[arg(long)]
    pub results: Option<PathBuf>,

    #[arg(long)]
    pub ssh_host: Option<String>,

    #[arg(long)]
    pub ssh_user: Option<String>,

    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    #[arg(long)]
    pub ssh_port: Option<u16>,
}
impl RunArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            repetitions: self.repetitions,
            results_dir: self.results.clone(),
            ssh_host: self.ssh_host.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_key: self.ssh_key.clone(),
            ssh_port: self.ssh_port,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacks_are_comma_separated() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "minima",
            "search",
            "--stacks",
            "node-postgres,node-mysql",
            "--script",
            "get_users.js",
            "--ssh-host",
            "10.0.0.12",
        ])?;

        let Commands::Search(run) = args.command else {
            anyhow::bail!("expected the search command");
        };
        assert_eq!(run.stacks, vec!["node-postgres", "node-mysql"]);
        assert_eq!(run.config, PathBuf::from("minima.toml"));
        assert_eq!(run.overrides().ssh_host.as_deref(), Some("10.0.0.12"));
        assert_eq!(run.overrides().repetitions, None);
        Ok(())
    }

    #[test]
    fn stacks_are_required() {
        let res = Args::try_parse_from(["minima", "sweep", "--script", "get_users.js"]);
        assert!(res.is_err());
    }
}
