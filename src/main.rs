use anyhow::Context;
use clap::{Parser, Subcommand};
use kherimoya::server::{ReconcileReport, ServerEvent};
use kherimoya::{CommandError, Error, InstanceSnapshot, Kherimoya};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::UNIX_EPOCH;
use tracing_subscriber::{EnvFilter, fmt};

/// Manage Minecraft Bedrock servers on this host.
#[derive(Parser, Debug)]
#[command(name = "kherimoya", author, version, about)]
struct Cli {
    /// Management root holding the configuration, registry and servers
    #[arg(long, env = "KHERIMOYA_ROOT", default_value = ".", global = true)]
    root: PathBuf,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new, stopped server
    Create {
        #[arg(long)]
        name: String,
    },
    /// Start a server and wait until it is ready
    Start {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
    },
    /// Stop a server gracefully, or acknowledge its crash
    Stop {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
    },
    /// Show one server
    Status {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
    },
    /// Show every server
    List,
    /// Remove a stopped server; its files are deleted only with --confirm
    Destroy {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
        #[arg(long)]
        confirm: bool,
    },
    /// Give a server a new name
    Rename {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
        #[arg(long)]
        name: String,
    },
    /// Send one console line to a running server
    Send {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
        #[arg(long)]
        text: String,
    },
    /// Print the recent console output of a running server
    Console {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: String,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Print the lifecycle events recorded by this process, for one server or all
    Events {
        #[arg(long = "server_id", alias = "server-id")]
        server_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Align recorded state with the live sessions
    Reconcile,
    /// Watch server health in the foreground until Ctrl-C
    Monitor,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine-readable.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kherimoya=info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<Error>()
                .map(|error| error.kind().exit_code())
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let manager = Kherimoya::open(&cli.root)
        .await
        .with_context(|| format!("failed to open {}", cli.root.display()))?;
    let json = cli.json;

    let outcome = match cli.command {
        Command::Create { name } => emit(json, manager.create(&name).await, print_instance)?,
        Command::Start { server_id } => emit(json, manager.start(&server_id).await, print_instance)?,
        Command::Stop { server_id } => emit(json, manager.stop(&server_id).await, print_instance)?,
        Command::Status { server_id } => {
            emit(json, manager.status(&server_id).await, print_instance)?
        }
        Command::List => emit(json, manager.list().await, |instances: &Vec<InstanceSnapshot>| {
            if instances.is_empty() {
                println!("no servers");
            }
            for instance in instances {
                print_instance(instance);
            }
        })?,
        Command::Destroy { server_id, confirm } => {
            emit(json, manager.destroy(&server_id, confirm).await, |instance: &InstanceSnapshot| {
                if confirm {
                    println!("destroyed {} and deleted {}", instance.id, instance.base_path.display());
                } else {
                    println!(
                        "destroyed {}; files kept at {}",
                        instance.id,
                        instance.base_path.display()
                    );
                }
            })?
        }
        Command::Rename { server_id, name } => {
            emit(json, manager.rename(&server_id, &name).await, print_instance)?
        }
        Command::Send { server_id, text } => {
            emit(json, manager.send_input(&server_id, &text).await, |instance: &InstanceSnapshot| {
                println!("sent to {}", instance.id)
            })?
        }
        Command::Console { server_id, lines } => {
            emit(json, manager.console(&server_id, lines).await, |output: &Vec<String>| {
                for line in output {
                    println!("{}", line);
                }
            })?
        }
        Command::Events { server_id, limit } => {
            let events = match server_id {
                Some(server_id) => manager.events(&server_id, limit).await,
                None => manager.all_events(limit).await,
            };
            emit(json, events, print_events)?
        }
        Command::Reconcile => emit(json, manager.reconcile().await, print_report)?,
        Command::Monitor => {
            let mut monitor = manager.monitor();
            monitor.start();
            tracing::info!("Monitoring, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            monitor.stop().await;
            match monitor.last_report() {
                Some(report) => emit(json, Ok(report), print_report)?,
                None => ExitCode::SUCCESS,
            }
        }
    };
    Ok(outcome)
}

/// Print a command outcome and pick the exit code.
fn emit<T: Serialize>(
    json: bool,
    result: Result<T, CommandError>,
    human: impl FnOnce(&T),
) -> anyhow::Result<ExitCode> {
    match result {
        Ok(value) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                human(&value);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&error)?);
            } else {
                let id = error
                    .server_id
                    .as_ref()
                    .map(|id| format!(" [{}]", id))
                    .unwrap_or_default();
                let state = error
                    .observed_state
                    .map(|state| format!(" (last known state: {})", state))
                    .unwrap_or_default();
                eprintln!("error{}: {}{}", id, error, state);
            }
            Ok(ExitCode::from(error.kind.exit_code()))
        }
    }
}

fn print_instance(instance: &InstanceSnapshot) {
    println!(
        "{}  {:<20} {:<8} (wants {})",
        instance.id, instance.name, instance.observed_state, instance.desired_state
    );
}

fn print_events(events: &Vec<ServerEvent>) {
    if events.is_empty() {
        println!("no events recorded");
    }
    for event in events {
        let at = event
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs())
            .unwrap_or_default();
        match &event.details {
            Some(details) => println!("{}  {}  {:?}  {}", at, event.id, event.event, details),
            None => println!("{}  {}  {:?}", at, event.id, event.event),
        }
    }
}

fn print_report(report: &ReconcileReport) {
    if report.is_clean() {
        println!("nothing to repair");
        return;
    }
    for id in &report.crashed {
        println!("crashed    {}", id);
    }
    for id in &report.recovered {
        println!("recovered  {}", id);
    }
    for id in &report.restarted {
        println!("restarted  {}", id);
    }
    for id in &report.adopted {
        println!("adopted    {}", id);
    }
    for orphan in &report.orphans {
        match &orphan.server_id {
            Some(id) => println!("orphan     {} ({})", orphan.session, id),
            None => println!("orphan     {}", orphan.session),
        }
    }
}
