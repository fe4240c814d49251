use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use meowrt::vm::Vm;

/// Run a compiled Meow script.
#[derive(Parser, Debug)]
#[command(name = "meowrt", about = "Register-based bytecode interpreter for the Meow scripting language")]
struct Cli {
    /// Parse the entry file as the binary `.meowb` format instead of text.
    #[arg(long)]
    binary: bool,

    /// Raise the log level; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Script to execute.
    entry_file: PathBuf,

    /// Arguments forwarded to the script (available as `system.argv`).
    #[arg(trailing_var_arg = true)]
    script_args: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:?}");
            ExitCode::from(1)
        }
    }
}

/// Top-level entry point, wrapped in `anyhow::Result` so every fallible step
/// - missing entry file, loader failure, unhandled runtime error - reports
/// through one context-carrying error type, per §7.
fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_env("RUST_LOG").init();

    if !cli.entry_file.exists() {
        anyhow::bail!("cannot open entry file '{}'", cli.entry_file.display());
    }

    let base_dir = cli
        .entry_file
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());

    let mut argv = vec![cli.entry_file.to_string_lossy().to_string()];
    argv.extend(cli.script_args);

    let mut vm = Vm::new(base_dir, argv);
    let entry_path = cli.entry_file.to_string_lossy().to_string();

    vm.interpret(&entry_path, cli.binary).with_context(|| format!("running '{entry_path}'"))
}
