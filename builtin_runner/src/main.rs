// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! CLI entry point for the builtin module bridge runner.

use anyhow::Result;
use clap::Parser;
use tracing::Level;

fn main() -> Result<()> {
    let args = builtin_runner::CliArgs::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    builtin_runner::run(&args, &mut std::io::stdout().lock())
}
