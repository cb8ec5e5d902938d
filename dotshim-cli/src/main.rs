mod app;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use dotshim::{
    rewriter::{RewriteOptions, RewriteReport},
    task::rewrite_file,
};

use crate::app::Cli;

#[derive(Debug, Serialize)]
struct ReportOutput {
    input: String,
    output: String,
    visited: usize,
    rewritten: usize,
    skipped: usize,
    sites: usize,
}

impl ReportOutput {
    fn new(cli: &Cli, output: &std::path::Path, report: RewriteReport) -> Self {
        ReportOutput {
            input: cli.input.display().to_string(),
            output: output.display().to_string(),
            visited: report.visited,
            rewritten: report.rewritten,
            skipped: report.skipped,
            sites: report.sites,
        }
    }
}

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .context("failed to set Ctrl+C handler")?;

    let cli = Cli::parse();

    // Show dotshim info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("dotshim", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let options = RewriteOptions {
        intercept_constructions: !cli.no_constructors,
        excluded_types: cli.exclude.clone(),
    };
    let output = cli.output.clone().unwrap_or_else(|| cli.input.clone());

    let report = rewrite_file(&cli.input, &output, &options)
        .with_context(|| format!("failed to rewrite '{}'", cli.input.display()))?;

    let data = ReportOutput::new(&cli, &output, report);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!(
            "{}: rewrote {} of {} methods, {} call sites intercepted ({} already processed)",
            data.output, data.rewritten, data.visited, data.sites, data.skipped
        );
    }
    Ok(())
}
