pub mod config;
pub mod diff;
pub mod episode;
pub mod episode_store;
pub mod errors;
pub mod export;
pub mod logging;
pub mod replay;

use std::io::{Read, Write};
use std::path::PathBuf;

use clap::{error::ErrorKind, Parser, Subcommand, ValueEnum};
use serde_json::json;

use config::{load_config, AppConfig, CliOverrides};
use episode::{EpisodeStatus, NewEpisode};
use episode_store::{EpisodeStore, ExportFilter, ListFilter};
use errors::EpilogError;
use export::write_jsonl;

#[derive(Debug, Clone, Parser)]
#[command(name = "epilog")]
#[command(about = "Episode ledger: ingest, query, replay, diff, and export agent task runs")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub db: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Ingest one episode from a JSON payload file ("-" reads stdin)
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print a stored episode, steps included
    Get { episode_id: String },
    /// List episode summaries, newest first
    List {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long, value_enum)]
        status: Option<CliStatus>,
        #[arg(long)]
        since_ms: Option<i64>,
        #[arg(long)]
        until_ms: Option<i64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Count episodes matching the agent/status filters
    Count {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long, value_enum)]
        status: Option<CliStatus>,
    },
    /// Print the replay-ready view of an episode
    Replay { episode_id: String },
    /// Compare two episodes step-by-step; left is the baseline
    Diff { left: String, right: String },
    /// Export matching episodes as JSONL (one JSON object per line)
    Export {
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long, value_enum)]
        status: Option<CliStatus>,
        #[arg(long)]
        since_ms: Option<i64>,
        #[arg(long)]
        until_ms: Option<i64>,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print ledger stats: service, version, episodes stored
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStatus {
    Running,
    Success,
    Failure,
    Timeout,
    Killed,
}

impl From<CliStatus> for EpisodeStatus {
    fn from(value: CliStatus) -> Self {
        match value {
            CliStatus::Running => EpisodeStatus::Running,
            CliStatus::Success => EpisodeStatus::Success,
            CliStatus::Failure => EpisodeStatus::Failure,
            CliStatus::Timeout => EpisodeStatus::Timeout,
            CliStatus::Killed => EpisodeStatus::Killed,
        }
    }
}

pub fn run() -> Result<i32, EpilogError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let mut stdout = std::io::stdout();
    run_with_args(&args, &mut stdout)
}

pub fn run_with_args(
    args: &[std::ffi::OsString],
    out: &mut impl Write,
) -> Result<i32, EpilogError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}").map_err(|e| EpilogError::Io(e.to_string()))?;
                return Ok(0);
            }
            _ => return Err(EpilogError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        db_path: cli.db.clone(),
        log_dir: cli.log_dir.clone(),
    };
    let cfg = load_config(&overrides)?;
    logging::init_run_log(&cfg.logging.dir, cfg.logging.budget_bytes);

    // The store is opened once here and passed by reference into every
    // operation; no ambient global.
    let store = EpisodeStore::open(&cfg.storage.db_path)?;
    dispatch(&cli.command, &cfg, &store, out)
}

fn dispatch(
    command: &Command,
    cfg: &AppConfig,
    store: &EpisodeStore,
    out: &mut impl Write,
) -> Result<i32, EpilogError> {
    match command {
        Command::Ingest { file } => {
            let payload = read_ingest_payload(file)?;
            let episode = store.create(payload)?;
            print_json(out, &episode)?;
            Ok(0)
        }
        Command::Get { episode_id } => match store.get(episode_id)? {
            Some(episode) => {
                print_json(out, &episode)?;
                Ok(0)
            }
            None => not_found(episode_id),
        },
        Command::List {
            agent_id,
            status,
            since_ms,
            until_ms,
            model,
            provider,
            tool,
            limit,
            offset,
        } => {
            let filter = ListFilter {
                agent_id: agent_id.clone(),
                status: status.map(Into::into),
                since_ms: *since_ms,
                until_ms: *until_ms,
                model: model.clone(),
                provider: provider.clone(),
                tool: tool.clone(),
            };
            let summaries = store.list(&filter, cfg.effective_limit(*limit), *offset)?;
            print_json(out, &summaries)?;
            Ok(0)
        }
        Command::Count { agent_id, status } => {
            let count = store.count(agent_id.as_deref(), status.map(Into::into))?;
            writeln!(out, "{count}").map_err(|e| EpilogError::Io(e.to_string()))?;
            Ok(0)
        }
        Command::Replay { episode_id } => match store.get_replay(episode_id)? {
            Some(replay) => {
                print_json(out, &replay)?;
                Ok(0)
            }
            None => not_found(episode_id),
        },
        Command::Diff { left, right } => match store.diff(left, right)? {
            Some(diff) => {
                print_json(out, &diff)?;
                Ok(0)
            }
            None => {
                eprintln!("not found: one or both episodes");
                Ok(1)
            }
        },
        Command::Export {
            agent_id,
            status,
            since_ms,
            until_ms,
            output,
        } => {
            let filter = ExportFilter {
                agent_id: agent_id.clone(),
                status: status.map(Into::into),
                since_ms: *since_ms,
                until_ms: *until_ms,
            };
            match output {
                Some(path) => {
                    let mut file = std::fs::File::create(path)
                        .map_err(|e| EpilogError::Io(e.to_string()))?;
                    write_jsonl(store, &filter, &mut file)?;
                }
                None => {
                    write_jsonl(store, &filter, out)?;
                }
            }
            Ok(0)
        }
        Command::Stats => {
            let count = store.count(None, None)?;
            print_json(
                out,
                &json!({
                    "service": "epilog",
                    "version": env!("CARGO_PKG_VERSION"),
                    "episodes_stored": count,
                }),
            )?;
            Ok(0)
        }
    }
}

fn read_ingest_payload(file: &PathBuf) -> Result<NewEpisode, EpilogError> {
    let text = if file.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| EpilogError::Io(e.to_string()))?;
        buffer
    } else {
        std::fs::read_to_string(file).map_err(|e| EpilogError::Io(e.to_string()))?
    };
    serde_json::from_str(&text)
        .map_err(|e| EpilogError::Validation(format!("malformed episode payload: {e}")))
}

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<(), EpilogError> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| EpilogError::Io(e.to_string()))?;
    writeln!(out, "{text}").map_err(|e| EpilogError::Io(e.to_string()))
}

fn not_found(episode_id: &str) -> Result<i32, EpilogError> {
    eprintln!("not found: {episode_id}");
    Ok(1)
}
