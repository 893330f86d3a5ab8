//! mathcell - stateful sandboxed numeric cells over HTTP.
//!
//! Usage:
//!   mathcell serve [--port 8080]          # Start HTTP server
//!   mathcell run [--latex] -- <code>      # Evaluate one cell and exit
//!   mathcell worker                       # Worker process (started by sessions)

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mathcell::config::SettingsArgs;
use mathcell::http_server;
use mathcell::manager::SessionManager;
use mathcell::state::AppState;
use mathcell::worker;

#[derive(Parser, Debug)]
#[command(name = "mathcell")]
#[command(about = "Stateful sandboxed numeric cells with an HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Evaluate a single cell in a throwaway session
    Run {
        /// Also print the LaTeX rendering of the result
        #[arg(long)]
        latex: bool,

        #[command(flatten)]
        settings: SettingsArgs,

        /// Cell source; read from stdin when omitted or `-`
        #[arg(last = true)]
        code: Vec<String>,
    },
    /// Serve the worker line protocol on stdin/stdout
    Worker,
}

fn init_tracing(default_level: &str, to_stderr: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Worker => {
            // stdout carries the protocol.
            init_tracing("warn", true);
            match worker::run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!("worker failed: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Serve { port, settings } => {
            init_tracing("info", false);
            let state = AppState::new(settings.into_settings());
            run_async(async move {
                http_server::run_server(port, state)
                    .await
                    .map(|()| ExitCode::SUCCESS)
            })
        }
        Commands::Run {
            latex,
            settings,
            code,
        } => {
            init_tracing("warn", true);
            let code = match read_code(code) {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("Error: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let manager = SessionManager::new(settings.into_settings());
            run_async(run_once(manager, code, latex))
        }
    }
}

fn run_async<F>(future: F) -> ExitCode
where
    F: std::future::Future<Output = std::io::Result<ExitCode>>,
{
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(future) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn read_code(args: Vec<String>) -> std::io::Result<String> {
    if args.is_empty() || args == ["-"] {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        return Ok(code);
    }
    Ok(args.join(" "))
}

async fn run_once(manager: SessionManager, code: String, latex: bool) -> std::io::Result<ExitCode> {
    let outcome = match manager.get("run").await {
        Ok(session) => session.evaluate(&code, latex, true, None).await,
        Err(err) => Err(err),
    };
    manager.shutdown().await;
    match outcome {
        Ok(result) => {
            print!("{}", result.stdout);
            if let Some(value) = result.result {
                println!("{value}");
            }
            if let Some(tex) = result.alt_format {
                println!("{tex}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            if let mathcell::error::CellError::Evaluation {
                traceback: Some(traceback),
                stdout,
                ..
            } = &err
            {
                print!("{stdout}");
                eprintln!("{traceback}");
            } else {
                eprintln!("Error: {err}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
