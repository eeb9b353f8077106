//! Binary entry point for the galley CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use galley::config::{ConfigError, GalleyConfig};
use galley::context::Context;
use galley::instance::{Instance, InstanceError};
use galley::lifecycle::{Action, DestroyPolicy, ParseLifecycleError};
use galley::project::{LoadOptions, Project, ProjectError};
use galley::registry::Registry;
use galley::runner::{self, Concurrency, RunAction, SelectError};
use galley::state::FileStateStore;

mod cli;

use cli::{Cli, Command, RunArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("project error: {0}")]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    DestroyMode(#[from] ParseLifecycleError),
    #[error("--concurrency must be at least 1")]
    ZeroConcurrency,
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("failed to launch `{program}`: {message}")]
    Login { program: String, message: String },
    #[error("{failed} of {total} instances failed")]
    Failed { failed: usize, total: usize },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = GalleyConfig::load_without_cli_args()?;
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));

    let context = Arc::new(Context::new(config.clone()));
    let options = LoadOptions {
        context,
        store: Arc::new(FileStateStore::new(config.state_path())),
    };
    let project = Project::load(&config.project_path(), &Registry::with_builtins(), &options)?;

    match cli.command {
        Command::Create(args) => drive(&project, &config, &args, lifecycle(Action::Create)).await,
        Command::Converge(args) => {
            drive(&project, &config, &args, lifecycle(Action::Converge)).await
        }
        Command::Setup(args) => drive(&project, &config, &args, lifecycle(Action::Setup)).await,
        Command::Verify(args) => drive(&project, &config, &args, lifecycle(Action::Verify)).await,
        Command::Destroy(args) => {
            drive(&project, &config, &args, lifecycle(Action::Destroy)).await
        }
        Command::Test(args) => {
            let policy = args.destroy.parse::<DestroyPolicy>()?;
            drive(&project, &config, &args.run, RunAction::Test(policy)).await
        }
        Command::List(args) => {
            let selected = runner::select(project.instances(), args.pattern.as_deref())?;
            write_listing(io::stdout(), &selected)?;
            Ok(0)
        }
        Command::Login(args) => login(&project, &args.name).await,
    }
}

const fn lifecycle(action: Action) -> RunAction {
    RunAction::Lifecycle(action)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn concurrency(args: &RunArgs, config: &GalleyConfig) -> Result<Concurrency, CliError> {
    match args.concurrency {
        Some(0) => Err(CliError::ZeroConcurrency),
        Some(limit) => Ok(Concurrency::Parallel { limit: Some(limit) }),
        None if args.parallel => Ok(Concurrency::Parallel {
            limit: config.max_concurrency,
        }),
        None => Ok(Concurrency::Sequential),
    }
}

async fn drive(
    project: &Project,
    config: &GalleyConfig,
    args: &RunArgs,
    action: RunAction,
) -> Result<i32, CliError> {
    let concurrency = concurrency(args, config)?;
    let selected = runner::select(project.instances(), args.pattern.as_deref())?;
    let total = selected.len();
    let report = runner::run(selected, action, concurrency).await;
    let failed = report.failures().count();
    if failed > 0 {
        return Err(CliError::Failed { failed, total });
    }
    Ok(0)
}

async fn login(project: &Project, name: &str) -> Result<i32, CliError> {
    let instance = project
        .instances()
        .iter()
        .find(|instance| instance.name() == name)
        .ok_or_else(|| SelectError::NoMatch(name.to_owned()))?;
    let command = instance.login_command()?;
    tracing::info!(instance = name, %command, "logging in");
    let status = tokio::process::Command::new(&command.program)
        .args(&command.args)
        .status()
        .await
        .map_err(|err| CliError::Login {
            program: command.program.clone(),
            message: err.to_string(),
        })?;
    Ok(status.code().unwrap_or(1))
}

fn write_listing(mut target: impl Write, instances: &[Arc<Instance>]) -> Result<(), CliError> {
    let mut rows = vec![[
        "Instance".to_owned(),
        "Driver".to_owned(),
        "Transport".to_owned(),
        "Provisioner".to_owned(),
        "Verifier".to_owned(),
        "Last Action".to_owned(),
    ]];
    for instance in instances {
        let last = instance
            .last_action()?
            .map_or_else(|| "<Not Created>".to_owned(), |action| action.to_string());
        rows.push([
            instance.name().to_owned(),
            instance.driver().name().to_owned(),
            instance.transport().name().to_owned(),
            instance.provisioner().name().to_owned(),
            instance.verifier().name().to_owned(),
            last,
        ]);
    }
    let widths = rows.iter().fold([0_usize; 6], |mut widths, row| {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
        widths
    });
    for row in &rows {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(target, "{}", line.trim_end()).ok();
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "galley: {err}").ok();
}
