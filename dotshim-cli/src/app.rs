use std::path::PathBuf;

use clap::Parser;

/// dotshim - add call interception to a CIL module container
#[derive(Debug, Parser)]
#[command(name = "dotshim", version, about, long_about = None)]
pub struct Cli {
    /// The input module that will be modified.
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// The path of the resulting module. Defaults to overwriting the input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Leave `newobj` sites alone and only intercept method calls.
    #[arg(long)]
    pub no_constructors: bool,

    /// Never rewrite methods of this type; a trailing `.` excludes a namespace.
    #[arg(long, value_name = "TYPE")]
    pub exclude: Vec<String>,

    /// Emit the rewrite report as JSON instead of human-readable text.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,
}
