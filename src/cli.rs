use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "automaa",
    about = "Runs automation agent queues across many accounts",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run queues now and wait for them to finish (Ctrl-C stops them)
    Run {
        /// Queue names from the config
        #[arg(required = true)]
        queues: Vec<String>,
    },

    /// Start queues at their scheduled times until interrupted
    Schedule,

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show recent queue runs
    History {
        /// Number of most recent runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}
