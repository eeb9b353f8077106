//! Command-line interface definitions for the `galley` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `galley` binary.
#[derive(Debug, Parser)]
#[command(
    name = "galley",
    about = "Provision, converge, and verify disposable test instances",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log filter used when `RUST_LOG` is unset, for example `debug`.
    #[arg(long, global = true, value_name = "FILTER")]
    pub(crate) log_level: Option<String>,
    /// Action to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `galley` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create the instances' machines.
    #[command(name = "create")]
    Create(RunArgs),
    /// Run the provisioner, creating machines first if needed.
    #[command(name = "converge")]
    Converge(RunArgs),
    /// Prepare converged instances for verification.
    #[command(name = "setup")]
    Setup(RunArgs),
    /// Run the verifier, converging first if needed.
    #[command(name = "verify")]
    Verify(RunArgs),
    /// Destroy the instances' machines and forget their state.
    #[command(name = "destroy")]
    Destroy(RunArgs),
    /// Destroy, converge, verify, and destroy again.
    #[command(name = "test")]
    Test(TestArgs),
    /// List instances and their last action.
    #[command(name = "list")]
    List(ListArgs),
    /// Open an interactive session on one instance.
    #[command(name = "login")]
    Login(LoginArgs),
}

/// Instance selection and scheduling shared by the lifecycle subcommands.
#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    /// Instance name, regular expression, or `all`.
    #[arg(value_name = "PATTERN")]
    pub(crate) pattern: Option<String>,
    /// Drive the selected instances concurrently.
    #[arg(short = 'p', long)]
    pub(crate) parallel: bool,
    /// Maximum instances in flight; implies `--parallel`.
    #[arg(short = 'c', long, value_name = "N")]
    pub(crate) concurrency: Option<usize>,
}

/// Arguments for `galley test`.
#[derive(Debug, Args)]
pub(crate) struct TestArgs {
    /// Selection and scheduling.
    #[command(flatten)]
    pub(crate) run: RunArgs,
    /// When to destroy afterwards: `passing`, `always`, or `never`.
    #[arg(long, value_name = "MODE", default_value = "passing")]
    pub(crate) destroy: String,
}

/// Arguments for `galley list`.
#[derive(Debug, Args)]
pub(crate) struct ListArgs {
    /// Instance name, regular expression, or `all`.
    #[arg(value_name = "PATTERN")]
    pub(crate) pattern: Option<String>,
}

/// Arguments for `galley login`.
#[derive(Debug, Args)]
pub(crate) struct LoginArgs {
    /// Exact instance name.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
}
