use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod flows;
mod render;

use flows::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "stowpack")]
#[command(about = "Declarative configuration package manager", long_about = None)]
struct Cli {
    /// Only consider packages from this source.
    #[arg(long, global = true)]
    source: Option<String>,
    /// Resolve the queue and report, without touching anything.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Do not turn copy steps into symlinks.
    #[arg(long, global = true)]
    literal_copies: bool,
    /// Where the installed state and backups live.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the packages visible from the configured sources.
    List,
    /// Install packages, dependencies included.
    Install { packages: Vec<String> },
    /// Uninstall packages, installed dependents first.
    Uninstall { packages: Vec<String> },
    /// Manage the configured package sources.
    #[command(subcommand)]
    Sources(SourceCommands),
}

#[derive(Subcommand, Debug)]
enum SourceCommands {
    List,
    Add { name: String, directory: PathBuf },
    Remove { name: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = RunOptions {
        source: cli.source,
        dry_run: cli.dry_run,
        literal_copies: cli.literal_copies,
        state_dir: cli.state_dir,
    };

    match cli.command {
        Commands::List => flows::list_packages(&options),
        Commands::Install { packages } => flows::install_packages(&options, &packages),
        Commands::Uninstall { packages } => flows::uninstall_packages(&options, &packages),
        Commands::Sources(SourceCommands::List) => flows::list_sources(&options),
        Commands::Sources(SourceCommands::Add { name, directory }) => {
            flows::add_source(&options, &name, &directory)
        }
        Commands::Sources(SourceCommands::Remove { name }) => {
            flows::remove_source(&options, &name)
        }
    }
}
