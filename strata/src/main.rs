#![forbid(unsafe_code)]

mod config;

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, WrapErr};
use strata_bytecode::{lower_program_with_options, LayoutTable};
use strata_core::{ApiReporter, SubtypeEngine};
use strata_mir::Program;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "MIR type checking and bytecode lowering")]
struct Cli {
    /// Config file. Defaults to `./strata.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Validate a serialized program
    Check {
        /// Program JSON
        program: PathBuf,
    },
    /// Lower a program to bytecode
    Lower {
        /// Program JSON
        program: PathBuf,

        /// Layout table JSON
        #[arg(long)]
        layout: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overrides `lower.max_specialization_rounds`
        #[arg(long)]
        max_rounds: Option<usize>,
    },
    /// Emit the API manifest of a program
    Api {
        /// Program JSON
        program: PathBuf,

        /// Entrypoint invoke key (repeatable). Overrides `api.entrypoints`.
        #[arg(long = "entry")]
        entries: Vec<String>,

        /// Report testable types instead of API types
        #[arg(long, default_value_t = false)]
        test_build: bool,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_program(path: &Path) -> miette::Result<Program> {
    let raw = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let program = Program::from_json(&raw)?;
    program.validate()?;
    debug!(
        path = %path.display(),
        types = program.graph.types.len(),
        invokes = program.invokes.len(),
        "loaded program"
    );
    Ok(program)
}

fn load_layout(path: &Path) -> miette::Result<LayoutTable> {
    let raw = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    LayoutTable::from_json(&raw)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse layout table {}", path.display()))
}

fn write_output(output: Option<&Path>, text: &str) -> miette::Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = text.len(), "wrote output");
            Ok(())
        }
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn main() -> miette::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Check { program } => {
            let p = load_program(&program)?;
            println!(
                "{}: ok ({} types, {} invokes, {} constants)",
                program.display(),
                p.graph.types.len(),
                p.invokes.len(),
                p.constants.len()
            );
            Ok(())
        }
        Cmd::Lower {
            program,
            layout,
            output,
            max_rounds,
        } => {
            let p = load_program(&program)?;
            let table = load_layout(&layout)?;
            let options = config.lower_options(max_rounds);

            let asm = lower_program_with_options(&p, &table, &options)?;
            info!(
                functions = asm.functions.len(),
                specializations = asm.specializations.len(),
                "lowered program"
            );
            let text = asm.to_json().into_diagnostic()?;
            write_output(output.as_deref(), &text)
        }
        Cmd::Api {
            program,
            entries,
            test_build,
            output,
        } => {
            let p = load_program(&program)?;
            let entries = if entries.is_empty() {
                config.api.entrypoints.clone()
            } else {
                entries
            };

            let subtypes = SubtypeEngine::new(&p.graph);
            let manifest = ApiReporter::new(&p, &subtypes)
                .emit_api_info(&entries, test_build || config.api.test_build)?;
            write_output(output.as_deref(), &manifest.to_json()?)
        }
    }
}
