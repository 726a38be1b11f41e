use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qualweave::constants::reliability::DEFAULT_PASSES;
use qualweave::pipeline::Methodology;

#[derive(Parser)]
#[command(name = "qualweave")]
#[command(
    version,
    about = "LLM-assisted qualitative coding for interview transcripts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize QualWeave in the current directory
    Init {
        #[arg(long, short, help = "Overwrite existing initialization")]
        force: bool,
    },

    /// Ingest transcript files into a project
    Ingest {
        #[arg(long, short, help = "Project name (created on first ingest)")]
        project: String,
        #[arg(
            long,
            short,
            default_value = "grounded-theory",
            help = "Methodology for a new project: grounded-theory, thematic-analysis, constant-comparison"
        )]
        methodology: Methodology,
        #[arg(required = true, help = "Transcript files (.txt)")]
        files: Vec<PathBuf>,
    },

    /// Run (or resume) the analysis pipeline
    Run {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, help = "Skip review checkpoints and auto-apply proposals")]
        no_review: bool,
    },

    /// Inspect or resolve the pending review queue
    Review {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, short, help = "List pending review items")]
        list: bool,
        #[arg(long, short, help = "JSON file with an array of decisions")]
        decisions: Option<PathBuf>,
    },

    /// Inter-rater reliability over repeated coding passes
    Irr {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, default_value_t = DEFAULT_PASSES, help = "Number of coding passes")]
        passes: usize,
        #[arg(
            long,
            help = "Model to use (repeat to compare models instead of passes)"
        )]
        model: Vec<String>,
    },

    /// Stability analysis: same prompt, varied sampling
    Stability {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, default_value_t = DEFAULT_PASSES, help = "Number of coding passes")]
        passes: usize,
    },

    /// Theoretical sampling: which documents to code next
    Sample {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, default_value = "5", help = "Maximum recommendations to show")]
        limit: usize,
    },

    /// Show project status
    Status {
        #[arg(long, short, help = "Project name (omit to list all projects)")]
        project: Option<String>,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Export the codebook as Markdown
    Export {
        #[arg(long, short, help = "Project name")]
        project: String,
        #[arg(long, short, help = "Output file (stdout when omitted)")]
        output: Option<PathBuf>,
        #[arg(long, default_value = "3", help = "Supporting quotes per code")]
        quotes: usize,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Initialize configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

fn main() -> ExitCode {
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    use qualweave::cli::commands;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Ingest {
            project,
            methodology,
            files,
        } => {
            commands::ingest::run(&project, methodology, &files)?;
        }
        Commands::Run { project, no_review } => {
            let rt = Runtime::new()?;
            rt.block_on(commands::run::run(&project, no_review))?;
        }
        Commands::Review {
            project,
            list,
            decisions,
        } => match (list, decisions) {
            (_, Some(path)) => commands::review::submit(&project, &path)?,
            _ => commands::review::list(&project)?,
        },
        Commands::Irr {
            project,
            passes,
            model,
        } => {
            let rt = Runtime::new()?;
            rt.block_on(commands::stats::irr(&project, passes, &model))?;
        }
        Commands::Stability { project, passes } => {
            let rt = Runtime::new()?;
            rt.block_on(commands::stats::stability(&project, passes))?;
        }
        Commands::Sample { project, limit } => {
            commands::sample::run(&project, limit)?;
        }
        Commands::Status { project, format } => {
            commands::status::run(project.as_deref(), &format)?;
        }
        Commands::Export {
            project,
            output,
            quotes,
        } => {
            commands::export::run(&project, output.as_deref(), quotes)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                commands::config::show(&format)?;
            }
            ConfigAction::Path => {
                commands::config::path()?;
            }
            ConfigAction::Init { global, force } => {
                if global {
                    commands::config::init_global(force)?;
                } else {
                    commands::config::init_project()?;
                }
            }
        },
    }

    Ok(())
}
