// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use clap::error::ErrorKind;
use clap::Parser;
use ds01_gpu_allocator::cli::{execute, Cli};

fn main() {
    // Initialize logging; diagnostics go to stderr so the stable stdout
    // tokens stay parseable by lifecycle hooks.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    match execute(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("❌ Error: {:#}", err);
            std::process::exit(1);
        }
    }
}
