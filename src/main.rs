use std::path::PathBuf;

use clap::{Parser, Subcommand};

use serial_exec::clients::{
    BenchConfig, DEFAULT_CLIENTS, DEFAULT_TASKS_PER_CLIENT, run_benchmark, run_demo, run_stress,
};
use serial_exec::logging;

/// Serial task service CLI.
#[derive(Parser)]
#[command(name = "serial_exec")]
#[command(about = "Run numeric tasks through a single serial worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit sin/sqrt/pow samples and print a summary (default)
    Demo,

    /// Run sin, sqrt and pow clients concurrently and print one CSV row
    Bench {
        /// Number of concurrent clients; kinds rotate sin, sqrt, pow
        #[arg(long, default_value_t = DEFAULT_CLIENTS)]
        clients: usize,

        /// Tasks submitted by each client
        #[arg(long, default_value_t = DEFAULT_TASKS_PER_CLIENT)]
        tasks: usize,

        /// Directory for the per-client result files
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Discard results instead of writing files
        #[arg(long)]
        no_output: bool,

        /// Check that no two task bodies ever overlap
        #[arg(long)]
        validate: bool,
    },

    /// Sweep client and task counts, printing one CSV row per combination
    Stress {
        /// Comma-separated client counts
        #[arg(long, value_delimiter = ',', default_values_t = [1usize, 2, 3, 6])]
        clients: Vec<usize>,

        /// Comma-separated task counts per client
        #[arg(long, value_delimiter = ',', default_values_t = [100usize, 1000])]
        tasks: Vec<usize>,

        /// Check that no two task bodies ever overlap
        #[arg(long)]
        validate: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init();

    let result = match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => run_demo(),
        Commands::Bench {
            clients,
            tasks,
            out_dir,
            no_output,
            validate,
        } => run_benchmark(&BenchConfig {
            clients,
            tasks_per_client: tasks,
            out_dir: (!no_output).then_some(out_dir),
            validate,
        }),
        Commands::Stress {
            clients,
            tasks,
            validate,
        } => run_stress(&clients, &tasks, validate),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
