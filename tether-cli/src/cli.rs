use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Run and supervise external commands")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command, forwarding its output, and exit with its exit code.
    Run(RunArgs),

    /// Stop a running process by pid or pid file.
    Stop(StopArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Kill the command after this many seconds (exit status 124).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Capacity in bytes of each output ring.
    #[arg(long, default_value_t = tether_kernel::config::PipeSize::Large.capacity())]
    pub pipe_size: usize,

    /// Run the command as this user.
    #[arg(long)]
    pub user: Option<String>,

    /// Feed this file to the command's stdin.
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// Log the command line before starting it.
    #[arg(long)]
    pub echo: bool,

    /// Write the child's pid here while it runs.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Command to run, looked up in PATH.
    pub program: String,

    /// Arguments, passed through verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
pub struct StopArgs {
    #[arg(long)]
    pub pid: Option<i32>,

    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}
