use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use amp_api::{AmpApi, ApiError, InProcApi, UpOptions};
use amp_core::{ClusterGraph, StateRecord};
use amp_ops::{MemorySubstrate, OrchestratorConfig, SubstrateClient};
use amp_persist::SqliteStateStore;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

mod render;

#[derive(Parser, Debug)]
#[command(name = "ampctl", version, about = "AMP stack and lifecycle CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// State database path (default: $AMP_DB_PATH or ~/.amp/amp.db)
    #[arg(long = "db", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lifecycle state records
    State {
        #[command(subcommand)]
        cmd: StateCmd,
    },
    /// Bring the stack described by a graph file up
    Up {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Force past missing images and startup timeouts
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
        /// Never pull images
        #[arg(long, action = ArgAction::SetTrue)]
        local: bool,
        /// Print the status table every tick
        #[arg(short = 'v', long, action = ArgAction::SetTrue)]
        verbose: bool,
        /// No progress output
        #[arg(short = 's', long, action = ArgAction::SetTrue)]
        silence: bool,
    },
    /// Re-run convergence on a running stack
    Redeploy {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        local: bool,
    },
    /// Remove the stack's services
    Down {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print service status; exit code is non-zero unless everything runs
    Status {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print status repeatedly
    Monitor {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Keep printing until Ctrl-C
        #[arg(long, action = ArgAction::SetTrue)]
        follow: bool,
        #[arg(long = "interval-ms", default_value_t = 2000)]
        interval_ms: u64,
    },
    /// Pull every image the graph references
    Pull {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Volume maintenance
    Volumes {
        #[command(subcommand)]
        cmd: VolumesCmd,
    },
}

#[derive(Subcommand, Debug)]
enum StateCmd {
    Create { id: String, initial: String },
    Get { id: String },
    Transition { id: String, to: String },
    Delete { id: String },
    /// All recorded states
    List,
}

#[derive(Subcommand, Debug)]
enum VolumesCmd {
    /// Remove the graph's volumes, waiting while they are in use
    Rm {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("AMP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("AMP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid AMP_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_graph(path: &PathBuf) -> Result<ClusterGraph> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading graph file {}", path.display()))?;
    Ok(ClusterGraph::from_yaml(&text)?)
}

fn open_store(db: Option<&str>) -> Result<SqliteStateStore> {
    match db {
        Some(p) => SqliteStateStore::open(p),
        None => SqliteStateStore::open_default(),
    }
}

/// The CLI drives the simulated substrate; a real engine client plugs in
/// through `SubstrateClient`.
fn build_api(store: Arc<SqliteStateStore>, graph: Option<&ClusterGraph>) -> InProcApi {
    let substrate = match graph {
        Some(g) => MemorySubstrate::seeded_from(g),
        None => MemorySubstrate::new(),
    };
    let client: Arc<dyn SubstrateClient> = Arc::new(substrate);
    InProcApi::new(store, client, OrchestratorConfig::from_env())
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

/// Exit code per error kind; conflicts are retryable and get their own code.
fn api_exit_code(e: &ApiError) -> i32 {
    match e {
        ApiError::Conflict(_) => 3,
        ApiError::NotFound(_) | ApiError::InvalidTransition(_) | ApiError::Validation(_) => 2,
        _ => 1,
    }
}

fn cancel_on_ctrl_c(api: &InProcApi) {
    let token = api.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = Arc::new(open_store(cli.db.as_deref())?);
    let color = render::use_color();

    let code = match cli.command {
        Commands::State { cmd } => {
            let api = build_api(store.clone(), None);
            let res = match cmd {
                StateCmd::Create { id, initial } => {
                    let res = api.create_state(&id, &initial).await;
                    res.map(|_| StateRecord { id, value: initial })
                }
                StateCmd::Get { id } => {
                    let res = api.get_state(&id).await;
                    res.map(|value| StateRecord { id, value })
                }
                StateCmd::Transition { id, to } => {
                    let res = api.transition(&id, &to).await;
                    if let Ok(from) = &res {
                        info!(id = %id, from = %from, to = %to, "state transitioned");
                    }
                    res.map(|_| StateRecord { id, value: to })
                }
                StateCmd::Delete { id } => {
                    let res = api.delete_state(&id).await;
                    res.map(|_| StateRecord { id, value: String::new() })
                }
                StateCmd::List => {
                    let recs = store.records(amp_store::STATE_PREFIX)?;
                    match cli.output {
                        Output::Human => recs.iter().for_each(|r| println!("{:<24} {}", r.id, r.value)),
                        Output::Json => print_json(&recs)?,
                    }
                    return Ok(());
                }
            };
            match res {
                Ok(rec) => {
                    match cli.output {
                        Output::Human if rec.value.is_empty() => println!("{} deleted", rec.id),
                        Output::Human => println!("{} {}", rec.id, rec.value),
                        Output::Json => print_json(&rec)?,
                    }
                    0
                }
                Err(e) => {
                    eprintln!("state error: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Up { file, force, local, verbose, silence } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            cancel_on_ctrl_c(&api);
            let opts = UpOptions { force, local, verbose, silence };
            let progress = (!silence).then(|| {
                let board = api.orchestrator().board().clone();
                tokio::spawn(async move {
                    let mut epochs = board.subscribe();
                    while epochs.changed().await.is_ok() {
                        let snap = board.load();
                        if verbose {
                            render::print_snapshot(&snap, color);
                        } else {
                            let ready = snap.rows.iter().filter(|r| r.ok > 0 || r.forced).count();
                            eprintln!("tick {}: {}/{} services up", snap.epoch, ready, snap.rows.len());
                        }
                    }
                })
            });
            let res = api.stack_up(&graph, opts).await;
            if let Some(p) = progress {
                p.abort();
            }
            match res {
                Ok(report) => {
                    match cli.output {
                        Output::Human => {
                            println!("stack {} is up after {} ticks", graph.name(), report.ticks);
                            if !report.forced.is_empty() {
                                println!("forced: {}", report.forced.join(", "));
                            }
                        }
                        Output::Json => print_json(&report)?,
                    }
                    0
                }
                Err(e) => {
                    eprintln!("up failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Redeploy { file, force, local } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            cancel_on_ctrl_c(&api);
            match api.stack_redeploy(&graph, UpOptions { force, local, ..UpOptions::default() }).await {
                Ok(report) => {
                    match cli.output {
                        Output::Human => println!("stack {} redeployed after {} ticks", graph.name(), report.ticks),
                        Output::Json => print_json(&report)?,
                    }
                    0
                }
                Err(e) => {
                    eprintln!("redeploy failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Down { file } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            match api.stack_down(&graph).await {
                Ok(report) => {
                    match cli.output {
                        Output::Human => {
                            println!("removed {} service(s)", report.removed.len());
                            for (name, err) in &report.failed {
                                eprintln!("failed to remove {}: {}", name, err);
                            }
                        }
                        Output::Json => print_json(&report)?,
                    }
                    if report.failed.is_empty() { 0 } else { 1 }
                }
                Err(e) => {
                    eprintln!("down failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Status { file } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            match api.cluster_status(&graph).await {
                Ok(snap) => {
                    match cli.output {
                        Output::Human => render::print_snapshot(&snap, color),
                        Output::Json => print_json(&snap)?,
                    }
                    snap.aggregate.exit_code()
                }
                Err(e) => {
                    eprintln!("status failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Monitor { file, follow, interval_ms } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            let mut handle = match api.monitor(&graph, Duration::from_millis(interval_ms.max(100))).await {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("monitor failed: {}", e);
                    std::process::exit(api_exit_code(&e));
                }
            };
            let mut last = amp_core::AggregateStatus::Stopped;
            loop {
                tokio::select! {
                    maybe = handle.rx.recv() => {
                        let Some(snap) = maybe else {
                            warn!("monitor stream closed");
                            break;
                        };
                        last = snap.aggregate;
                        match cli.output {
                            Output::Human => render::print_snapshot(&snap, color),
                            Output::Json => println!("{}", serde_json::to_string(&snap)?),
                        }
                        if !follow {
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping monitor");
                        break;
                    }
                }
            }
            handle.cancel.cancel();
            last.exit_code()
        }
        Commands::Pull { file } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            match api.pull_images(&graph).await {
                Ok(report) => {
                    match cli.output {
                        Output::Human => {
                            println!("pulled {} image(s)", report.pulled.len());
                            for (image, err) in &report.failed {
                                eprintln!("failed to pull {}: {}", image, err);
                            }
                            for image in &report.timed_out {
                                eprintln!("timed out pulling {}", image);
                            }
                        }
                        Output::Json => print_json(&report)?,
                    }
                    if report.is_complete() { 0 } else { 1 }
                }
                Err(e) => {
                    eprintln!("pull failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
        Commands::Volumes { cmd: VolumesCmd::Rm { file } } => {
            let graph = load_graph(&file)?;
            let api = build_api(store.clone(), Some(&graph));
            match api.remove_volumes(&graph).await {
                Ok(left) => {
                    match cli.output {
                        Output::Human if left.is_empty() => println!("removed {} volume(s)", graph.volumes().len()),
                        Output::Human => eprintln!("volumes still in use: {}", left.join(", ")),
                        Output::Json => print_json(&left)?,
                    }
                    if left.is_empty() { 0 } else { 1 }
                }
                Err(e) => {
                    eprintln!("volume removal failed: {}", e);
                    api_exit_code(&e)
                }
            }
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
