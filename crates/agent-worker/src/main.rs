// Entry point for the agent worker process.
// Maps the `Program.cs` entry point of `Agent.Worker`, reduced to running a
// single step described by a JSON file.

use agent_common::{HostContext, TaskResult};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use agent_worker::step_runner::{StepDefinition, StepRunner};

#[derive(Parser, Debug)]
#[command(name = "Agent.Worker", about = "Pipelines agent worker")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Diagnostic log format.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one step and exit with its result code.
    RunStep {
        /// Step definition (handler data, inputs, variables, endpoints...).
        #[arg(long)]
        step: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {e}");
            std::process::exit(TaskResult::Failed.to_return_code());
        }
    };

    let exit_code = runtime.block_on(async move { run(args).await });
    std::process::exit(exit_code);
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

async fn run(args: Args) -> i32 {
    init_tracing(args.log_format);
    tracing::info!("Worker process starting.");

    let host_context = HostContext::new("Worker");
    if let Err(e) = host_context.load_settings() {
        tracing::warn!("Failed to load agent settings, using defaults: {:#}", e);
    }
    {
        let host_context = Arc::clone(&host_context);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                host_context.shutdown("Received interrupt signal.");
            }
        });
    }

    let result = match args.command {
        Command::RunStep { step } => match StepDefinition::load(&step) {
            Ok(definition) => StepRunner::new(Arc::clone(&host_context)).run(definition).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(result) => {
            let return_code = result.to_return_code();
            tracing::info!("Step completed with result {result} (return code {return_code})");
            return_code
        }
        Err(e) => {
            tracing::error!("Worker failed with error: {:#}", e);
            TaskResult::Failed.to_return_code()
        }
    }
}
