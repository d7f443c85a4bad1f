use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Durable render queue: turns timeline projects into encoded video files.
#[derive(Parser, Debug)]
#[command(name = "rust-render", version, about, long_about = None)]
pub struct Args {
    /// Log filter directive, replacing RUST_LOG (e.g. "rust_render=debug")
    #[arg(long, global = true, env = "RENDER_LOG_FILTER")]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker pool until interrupted
    Serve,

    /// Enqueue a project file
    Enqueue {
        /// Path to the project JSON
        project: PathBuf,

        /// Job name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Higher priorities are claimed first
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i64,
    },

    /// Print queue statistics and job snapshots as JSON
    Status {
        /// Only print this job
        #[arg(long)]
        job: Option<String>,
    },

    /// Stop accepting and dispatching jobs
    Drain {
        /// Wait for active jobs and keep queued ones, instead of discarding
        /// queued jobs immediately
        #[arg(long)]
        wait: bool,
    },

    /// Accept and dispatch jobs again after a drain
    Resume,

    /// Cancel a queued or active job
    Cancel {
        /// Job id
        job: String,
    },
}
