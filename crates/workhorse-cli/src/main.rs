//! Workhorse CLI - Run a supervised worker and send it commands.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workhorse_supervisor::{Completion, Supervisor, SupervisorConfig, SupervisorError};

/// How long to wait for the observer to print the last events on exit.
const OBSERVER_DRAIN: Duration = Duration::from_secs(2);

/// Workhorse CLI - supervised model worker
#[derive(Parser)]
#[command(name = "workhorse")]
#[command(about = "Run a worker script under supervision and talk to it", long_about = None)]
struct Cli {
    /// Project root (used to find the virtual environment)
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Worker script, relative to the project root
    #[arg(short, long, default_value = "python/main.py")]
    script: PathBuf,

    /// Interpreter to use instead of the project's virtual environment
    #[arg(long)]
    python: Option<PathBuf>,

    /// Fail a request after this many seconds without a reply
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Alternate source for llama-cpp-python (index URL or wheel URL)
    #[arg(long)]
    package_source: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a model
    Load {
        /// Path to the model file
        #[arg(short, long)]
        model: String,
    },

    /// Load a model and solve a problem with it
    Solve {
        /// Path to the model file
        #[arg(short, long)]
        model: String,

        /// Problem text
        #[arg(short, long)]
        problem: String,
    },

    /// Send a raw command
    Send {
        /// Command name
        command: String,

        /// Payload JSON
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Read `<command> [payload json]` lines from stdin
    Repl,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries events and results.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli);
    info!(
        interpreter = %config.interpreter.display(),
        script = %config.script.display(),
        "Starting workhorse"
    );

    let supervisor = Supervisor::new(config);
    supervisor.set_package_source(cli.package_source.clone());
    let observer = supervisor.on_event(|event| match serde_json::to_string(&event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize event"),
    });
    supervisor.start()?;

    let result = match cli.command {
        Commands::Load { model } => supervisor.load_model(&model).await.map(Some),
        Commands::Solve { model, problem } => supervisor
            .load_and_solve(&model, &problem, cli.package_source)
            .await
            .map(Some),
        Commands::Send { command, payload } => {
            let payload = parse_payload(payload.as_deref())?;
            supervisor.send(command, payload).await.map(Some)
        }
        Commands::Repl => repl(&supervisor).await.map(|()| None),
    };

    supervisor.stop();
    // The observer ends once the last supervisor handle is gone.
    drop(supervisor);
    if tokio::time::timeout(OBSERVER_DRAIN, observer).await.is_err() {
        warn!("Observer did not finish, some events may be missing");
    }

    match result {
        Ok(Some(completion)) => print_completion(&completion)?,
        Ok(None) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn build_config(cli: &Cli) -> SupervisorConfig {
    let mut config = SupervisorConfig::for_project(&cli.project_root, &cli.script);
    if let Some(python) = &cli.python {
        config = config.with_interpreter(python);
    }
    if let Some(secs) = cli.timeout_secs {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    config
}

fn parse_payload(payload: Option<&str>) -> Result<Value, serde_json::Error> {
    match payload {
        Some(text) => serde_json::from_str(text),
        None => Ok(Value::Null),
    }
}

async fn repl(supervisor: &Supervisor) -> Result<(), SupervisorError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, payload) = match line.split_once(' ') {
            Some((command, rest)) => (command, Some(rest.trim())),
            None => (line, None),
        };
        let payload = match parse_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                eprintln!("Invalid payload: {}", e);
                continue;
            }
        };

        match supervisor.send(command, payload).await {
            Ok(completion) => {
                if let Err(e) = print_completion(&completion) {
                    eprintln!("Failed to print result: {}", e);
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    Ok(())
}

fn print_completion(completion: &Completion) -> Result<(), serde_json::Error> {
    let finished = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    println!(
        "Result ({}) at {}:",
        completion.task.as_deref().unwrap_or("-"),
        finished
    );
    println!("{}", serde_json::to_string_pretty(&completion.data)?);
    Ok(())
}
