//! Command-line front end for the Overture compiler.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use overture::{CompileConfig, Compiler, MacroTable};

#[derive(Parser, Debug)]
#[command(name = "overture", version, about = "Compile an orchestra source file")]
struct Cli {
    /// Orchestra source file.
    file: PathBuf,

    /// Worker threads the compiled graph will be scheduled on. Values
    /// above 1 enable dependency analysis and lock insertion.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Log intermediate trees between stages (needs RUST_LOG=debug).
    #[arg(long)]
    debug: bool,

    /// Define a macro before preprocessing, as NAME or NAME=VALUE.
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,

    /// YAML file of additional macro definitions (name: body pairs).
    #[arg(long, value_name = "FILE")]
    defines: Option<PathBuf>,

    /// Print the compiled instruction listing.
    #[arg(long)]
    dump: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = fs::read_to_string(&cli.file)?;

    let mut macros = MacroTable::with_builtins();
    if let Some(path) = &cli.defines {
        let defs: BTreeMap<String, String> = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        for (name, body) in defs {
            macros.define(&name, Vec::new(), body);
        }
    }
    for def in &cli.define {
        match def.split_once('=') {
            Some((name, value)) => macros.define(name, Vec::new(), value.to_string()),
            None => macros.define(def, Vec::new(), "1".to_string()),
        }
    }

    let config = CompileConfig {
        num_threads: cli.threads,
        debug: cli.debug,
    };
    let compiler = Compiler::new(config);
    let compiled = compiler.compile_with_macros(&source, macros)?;

    if cli.dump {
        print!("{}", compiled.graph.dump());
    }
    println!(
        "compiled {} instrument(s), {} global(s), {} lock(s)",
        compiled.graph.instruments.len(),
        compiled.graph.global_count,
        compiled.graph.locks.len()
    );
    Ok(())
}
