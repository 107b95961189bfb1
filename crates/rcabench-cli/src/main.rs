//! Binary entry point for rcabench-view

use anyhow::Result;
use clap::Parser;
use rcabench_cli::Main;

fn main() -> Result<()> {
    rcabench_cli::Cli::parse().main()
}
