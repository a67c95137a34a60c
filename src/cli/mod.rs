pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::amqp;
use crate::task::defaults;

use config::Config;

#[derive(Parser)]
#[command(name = "mida", version, about = "A tool for web measurement")]
pub struct Cli {
    /// Number of parallel browser instances to use for crawling
    #[arg(short = 'c', long, global = true)]
    pub crawlers: Option<usize>,

    /// Number of parallel workers storing task results
    #[arg(short = 's', long, global = true)]
    pub storers: Option<usize>,

    /// Enable monitoring of visit statistics
    #[arg(short = 'm', long, global = true)]
    pub monitor: bool,

    /// Port used for hosting metrics for a Prometheus server
    #[arg(long = "prom-port", global = true)]
    pub prom_port: Option<u16>,

    /// Log level (0=Error, 1=Warn, 2=Info, 3=Debug)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<u8>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and execute tasks from a JSON task file
    File {
        /// Task file to process
        #[arg(short = 'f', long = "task-file")]
        task_file: PathBuf,

        /// Randomize processing order for tasks
        #[arg(long, action = ArgAction::Set, default_value_t = defaults::DEFAULT_SHUFFLE)]
        shuffle: bool,
    },

    /// Build a task set from CLI options and execute it immediately
    Go {
        #[command(flatten)]
        build: BuildOpts,

        /// Randomize processing order for tasks
        #[arg(long, action = ArgAction::Set, default_value_t = defaults::DEFAULT_SHUFFLE)]
        shuffle: bool,
    },

    /// Build a task file from CLI options and save it
    Build {
        #[command(flatten)]
        build: BuildOpts,

        /// Path to write the newly-created JSON task file
        #[arg(short = 'o', long)]
        outfile: PathBuf,

        /// Allow overwriting an existing task file
        #[arg(short = 'x', long)]
        overwrite: bool,
    },

    /// Read tasks from a JSON file and load them into an AMQP queue
    Load {
        /// Task file to process
        #[arg(short = 'f', long = "task-file")]
        task_file: PathBuf,

        /// Queue into which tasks will be loaded
        #[arg(short = 'q', long, default_value = amqp::DEFAULT_QUEUE)]
        queue: String,

        /// Priority of the loaded tasks (1-10)
        #[arg(short = 'p', long, default_value_t = amqp::DEFAULT_PRIORITY)]
        priority: u8,

        /// Randomize loading order for tasks
        #[arg(long, action = ArgAction::Set, default_value_t = defaults::DEFAULT_SHUFFLE)]
        shuffle: bool,
    },

    /// Act as a crawler client, pulling tasks from an AMQP queue
    Client {},
}

/// Options shared by the `build` and `go` task-set builders.
#[derive(Args)]
pub struct BuildOpts {
    /// File containing URLs to visit (one per line)
    #[arg(short = 'f', long = "url-file")]
    pub url_file: PathBuf,

    /// Path to the browser binary to use for this task set
    #[arg(short = 'b', long)]
    pub browser: Option<String>,

    /// User data directory to use for this task set
    #[arg(short = 'd', long = "user-data-dir")]
    pub user_data_dir: Option<String>,

    /// Flags to add to the browser launch (comma-separated)
    #[arg(long = "add-browser-flags", value_delimiter = ',')]
    pub add_browser_flags: Vec<String>,

    /// Flags to remove from the browser launch (comma-separated)
    #[arg(long = "remove-browser-flags", value_delimiter = ',')]
    pub remove_browser_flags: Vec<String>,

    /// Flags overriding the default browser flags (comma-separated)
    #[arg(long = "set-browser-flags", value_delimiter = ',')]
    pub set_browser_flags: Vec<String>,

    /// Full paths to browser extensions to use (comma-separated)
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Completion condition for the tasks
    #[arg(short = 'y', long = "completion", default_value = "TimeoutOnly")]
    pub completion: String,

    /// Seconds after which the browser closes and the task completes
    #[arg(short = 't', long, default_value_t = defaults::DEFAULT_TIMEOUT_SECS)]
    pub timeout: i64,

    /// Seconds to remain on the page after the load event
    #[arg(long = "time-after-load", default_value_t = defaults::DEFAULT_TIME_AFTER_LOAD_SECS)]
    pub time_after_load: i64,

    /// Gather and store all resources downloaded by the browser
    #[arg(long = "all-resources", action = ArgAction::Set, default_value_t = defaults::DEFAULT_ALL_RESOURCES)]
    pub all_resources: bool,

    /// Gather and store metadata about each resource
    #[arg(long = "resource-metadata", action = ArgAction::Set, default_value_t = defaults::DEFAULT_RESOURCE_METADATA)]
    pub resource_metadata: bool,

    /// Where to store results: a local path, ssh://host/path, or "none"
    #[arg(short = 'r', long = "results-output-path", default_value = defaults::DEFAULT_LOCAL_OUTPUT_PATH)]
    pub results_output_path: String,

    /// How many times to repeat each URL
    #[arg(long, default_value_t = 1)]
    pub repeat: i64,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Applies the root-level flags on top of the environment configuration and
/// dispatches the subcommand.
pub async fn process_command(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(crawlers) = cli.crawlers {
        config.crawlers = crawlers;
    }
    if let Some(storers) = cli.storers {
        config.storers = storers;
    }
    if cli.monitor {
        config.monitor = true;
    }
    if let Some(port) = cli.prom_port {
        config.prom_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    match cli.command {
        Commands::File { task_file, shuffle } => {
            commands::run_file(&config, task_file, shuffle).await
        }
        Commands::Go { build, shuffle } => commands::run_go(&config, &build, shuffle).await,
        Commands::Build {
            build,
            outfile,
            overwrite,
        } => commands::run_build(&build, &outfile, overwrite),
        Commands::Load {
            task_file,
            queue,
            priority,
            shuffle,
        } => commands::run_load(&config, task_file, &queue, priority, shuffle).await,
        Commands::Client {} => commands::run_client(&config).await,
    }
}
