//! gvweave CLI
//!
//! Command-line interface for running the weaving pass over a serialised
//! program: reads a JSON bundle holding the IR program, the verifier's
//! method images and the residual-check table, and writes the woven
//! program back out as JSON.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use gv_ir::program::Program;
use gv_ir::vir::{ResidualTable, VirProgram};
use gv_weaver::WeaverConfig;

#[derive(Parser)]
#[command(name = "gvweave")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Weave residual verifier obligations into runtime checks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Weave a program bundle into a checked program
    Weave {
        /// Input JSON bundle: {"program", "verifier", "checks"}
        input: PathBuf,

        /// Output path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Weaver configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pretty-print the output JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// The bundle a front end hands to the weaver.
#[derive(Deserialize)]
struct WeaveInput {
    program: Program,
    verifier: VirProgram,
    checks: ResidualTable,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Weave {
            input,
            output,
            config,
            pretty,
        } => {
            run_weave(&input, output.as_deref(), config.as_deref(), pretty);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "gvweave", &mut io::stdout());
        }
    }
}

fn run_weave(input: &Path, output: Option<&Path>, config: Option<&Path>, pretty: bool) {
    let config = match config {
        Some(path) => match WeaverConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        },
        None => WeaverConfig::new(),
    }
    .with_pretty(pretty);

    let content = match std::fs::read_to_string(input) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error: failed to read '{}': {}", input.display(), e);
            process::exit(1);
        }
    };
    let bundle: WeaveInput = match serde_json::from_str(&content) {
        Ok(bundle) => bundle,
        Err(e) => {
            eprintln!("Error: invalid input bundle: {}", e);
            process::exit(1);
        }
    };

    let mut program = bundle.program;
    if let Err(e) = gv_weaver::weave(&mut program, &bundle.verifier, &bundle.checks, &config) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let rendered = if config.pretty {
        serde_json::to_string_pretty(&program)
    } else {
        serde_json::to_string(&program)
    };
    let rendered = match rendered {
        Ok(rendered) => rendered,
        Err(e) => {
            eprintln!("Error: failed to serialise woven program: {}", e);
            process::exit(1);
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, rendered) {
                eprintln!("Error: failed to write '{}': {}", path.display(), e);
                process::exit(1);
            }
        }
        None => println!("{}", rendered),
    }
}
