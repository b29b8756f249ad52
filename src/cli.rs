//! CLI definition and dispatch.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::client_cache::ClientCache;
use crate::adapters::csv_candles::read_candles;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::paper_broker::PaperBroker;
use crate::adapters::sqlite_run_store::SqliteRunStore;
use crate::domain::calendar::TradingCalendar;
use crate::domain::error::AlphaloopError;
use crate::domain::formula_parser;
use crate::domain::run::RunId;
use crate::ports::broker_port::{AccountRef, BrokerPort, InstrumentMeta};
use crate::ports::config_port::ConfigPort;
use crate::ports::run_store_port::RunStorePort;
use crate::scheduler::driver::{ForwardTester, SchedulerSettings, StartRequest};

#[derive(Parser, Debug)]
#[command(name = "alphaloop", about = "Alpha formula forward-testing daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a formula and print its tree or a positioned error
    Check {
        formula: String,
    },
    /// Run the polling driver against the configured store and broker
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Start a forward test for an account in the sandbox universe
    Start {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: String,
        #[arg(long)]
        formula: String,
        /// Comma-separated tickers, e.g. SBER,GAZP,LKOH
        #[arg(long)]
        instruments: String,
        #[arg(long)]
        weekends: bool,
    },
    /// Stop a running forward test
    Stop {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        run_id: i64,
    },
    /// List persisted forward-test runs as JSON
    List {
        #[arg(short, long)]
        config: PathBuf,
        /// Include closed runs
        #[arg(long)]
        all: bool,
    },
    /// Print portfolio value history for a run
    History {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        run_id: i64,
    },
}

pub async fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Check { formula } => run_check(&formula),
        Command::Run { config } => run_daemon(&config).await,
        Command::Start {
            config,
            account,
            formula,
            instruments,
            weekends,
        } => run_start(&config, &account, &formula, &instruments, weekends).await,
        Command::Stop { config, run_id } => run_stop(&config, run_id).await,
        Command::List { config, all } => run_list(&config, all),
        Command::History { config, run_id } => run_history(&config, run_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            (&err).into()
        }
    }
}

fn run_check(formula: &str) -> Result<(), AlphaloopError> {
    match formula_parser::compile(formula) {
        Ok(program) => {
            println!("{:#?}", program.root);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", err.display_with_context(formula));
            Err(err.into())
        }
    }
}

fn load_config(path: &Path) -> Result<FileConfigAdapter, AlphaloopError> {
    FileConfigAdapter::from_file(path).map_err(|e| AlphaloopError::ConfigParse {
        file: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Parse the `[broker] accounts` list: `name:cash` pairs, comma separated.
fn parse_accounts(raw: &str) -> Result<Vec<(String, f64)>, AlphaloopError> {
    let invalid = |entry: &str| AlphaloopError::ConfigInvalid {
        section: "broker".into(),
        key: "accounts".into(),
        reason: format!("expected name:cash, found '{}'", entry),
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, cash) = entry.split_once(':').ok_or_else(|| invalid(entry))?;
            let cash: f64 = cash.trim().parse().map_err(|_| invalid(entry))?;
            Ok((name.trim().to_string(), cash))
        })
        .collect()
}

/// Build the sandbox paper broker from `[broker]`: every `*.csv` in
/// `data_dir` becomes a tradable instrument, accounts are opened up front.
fn build_paper_broker(config: &dyn ConfigPort) -> Result<Arc<PaperBroker>, AlphaloopError> {
    let data_dir = config
        .get_string("broker", "data_dir")
        .ok_or_else(|| AlphaloopError::ConfigMissing {
            section: "broker".into(),
            key: "data_dir".into(),
        })?;
    let currency = config
        .get_string("broker", "currency")
        .unwrap_or_else(|| "RUB".to_string());

    let broker = PaperBroker::new();
    let mut instruments = 0usize;
    for entry in std::fs::read_dir(&data_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let ticker = stem.to_uppercase();
        let lot_size = config.get_int("broker", &format!("lot.{}", ticker.to_lowercase()), 1);
        let candles = read_candles(&path)?;
        broker.add_instrument(
            InstrumentMeta {
                id: format!("paper-{}", ticker),
                ticker: ticker.clone(),
                name: ticker,
                currency: currency.clone(),
                lot_size,
            },
            candles,
        );
        instruments += 1;
    }
    info!(instruments, data_dir = %data_dir, "sandbox universe loaded");

    if let Some(accounts) = config.get_string("broker", "accounts") {
        for (name, cash) in parse_accounts(&accounts)? {
            broker.open_account(&name, cash);
        }
    }

    Ok(Arc::new(broker))
}

/// Assemble the full driver stack from a config file. The broker comes out
/// of a client cache keyed by credential, so several components can share
/// one connection and a credential rotation can drop it explicitly.
fn build_tester(config: Arc<FileConfigAdapter>) -> Result<ForwardTester, AlphaloopError> {
    let cache = ClientCache::new(Box::new({
        let config = Arc::clone(&config);
        move |_key| build_paper_broker(config.as_ref()).map(|b| b as Arc<dyn BrokerPort>)
    }));
    let broker = cache.get_or_create("sandbox")?;

    let store: Arc<dyn RunStorePort> = Arc::new(SqliteRunStore::from_config(config.as_ref())?);
    let calendar = TradingCalendar::from_config(config.as_ref());
    let settings = SchedulerSettings::from_config(config.as_ref());

    Ok(ForwardTester::new(broker, store, calendar, settings))
}

async fn run_daemon(config_path: &Path) -> Result<(), AlphaloopError> {
    let config = Arc::new(load_config(config_path)?);
    let tester = build_tester(config)?;

    tokio::select! {
        _ = tester.run_forever() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn run_start(
    config_path: &Path,
    account: &str,
    formula: &str,
    instruments: &str,
    weekends: bool,
) -> Result<(), AlphaloopError> {
    let config = Arc::new(load_config(config_path)?);
    let tester = build_tester(config)?;

    let tickers: Vec<String> = instruments
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let run_id = tester
        .start_run(StartRequest {
            account: AccountRef(account.to_string()),
            formula: formula.to_string(),
            tickers,
            trade_on_weekends: weekends,
        })
        .await?;

    println!("started run {}", run_id);
    Ok(())
}

async fn run_stop(config_path: &Path, run_id: i64) -> Result<(), AlphaloopError> {
    let config = Arc::new(load_config(config_path)?);
    let tester = build_tester(config)?;
    tester.stop_run(RunId(run_id)).await?;
    println!("stopped run {}", run_id);
    Ok(())
}

fn run_list(config_path: &Path, all: bool) -> Result<(), AlphaloopError> {
    let config = load_config(config_path)?;
    let store = SqliteRunStore::from_config(&config)?;
    let runs = if all {
        store.list_runs()?
    } else {
        store.list_active_runs()?
    };
    let json = serde_json::to_string_pretty(&runs).map_err(|e| AlphaloopError::Store {
        reason: e.to_string(),
    })?;
    println!("{}", json);
    Ok(())
}

async fn run_history(config_path: &Path, run_id: i64) -> Result<(), AlphaloopError> {
    let config = Arc::new(load_config(config_path)?);
    let tester = build_tester(config)?;
    let history = tester.get_history(RunId(run_id)).await?;
    for point in history {
        println!("{}\t{:.2}", point.date, point.value);
    }
    Ok(())
}
