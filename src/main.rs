//! ethload - synthetic ERC-20 transaction load against an Ethereum node
//!
//! Derives a set of load accounts, funds them from a funder account, then
//! submits token transfers at a fixed rate while recording gas prices and
//! per-block statistics.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::format_ether;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod chain;
mod config;
mod error;
mod gas;
mod load;
mod metrics;
mod results;
mod retry;
mod stats;
mod task;
mod tx;

use chain::{BlockMonitor, EthersNode, RpcGateway};
use config::Settings;
use gas::{wei_to_gwei, GasOracle, GasPriceMonitor, HttpGasOracle};
use load::{confirm_spend, plan_transfers, FundingPlanner};
use metrics::MetricsServer;
use retry::TimeoutRetry;
use results::{
    run_id, AccountRecord, BlockStat, CsvWriter, PlannedTransfer, ResultSink, TxLatency, TxResult,
};
use tx::{AccountLedger, RateDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ethload v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let load_config = settings.load.clone();
    info!(
        "Loaded configuration: {} accounts, {} tx/s for {}s",
        load_config.account_count, load_config.tx_per_sec, load_config.test_duration_secs
    );

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Node access
    let node = EthersNode::new(&settings.node)?;
    info!("Connected node client for chain {}", node.chain_id());
    let token: Address = settings
        .token
        .address
        .parse()
        .with_context(|| format!("Invalid token address: {}", settings.token.address))?;
    let gateway = Arc::new(RpcGateway::new(
        Arc::new(node),
        settings.node.chain_id,
        token,
        settings.node.retry_delay(),
        settings.send.clone(),
    ));
    let oracle: Arc<dyn GasOracle> = Arc::new(HttpGasOracle::new(&settings.oracle)?);
    let oracle_retry = TimeoutRetry::new(settings.node.retry_delay());

    // Accounts
    let ledger = Arc::new(AccountLedger::new(settings.node.chain_id));
    let funder_wallet: LocalWallet = settings
        .funder
        .private_key
        .parse()
        .context("Invalid funder private key")?;
    let funder_nonce = gateway.get_nonce(funder_wallet.address()).await?;
    let funder = ledger.import(&settings.funder.private_key, funder_nonce)?;
    info!("Funder {:?} starts at nonce {}", funder.address(), funder_nonce);

    let accounts = (0..load_config.account_count)
        .map(|_| ledger.derive_next())
        .collect::<Result<Vec<_>, _>>()?;

    let run = run_id();
    let output_dir = settings.output.dir.clone();
    let account_file = CsvWriter::<AccountRecord>::in_dir(&output_dir, "accounts", &run)?;
    let summaries: Vec<_> = accounts.iter().map(|a| ledger.to_summary(a)).collect();
    account_file.append_all(&summaries)?;
    info!("Derived {} accounts, written to {:?}", accounts.len(), account_file.path());

    // Schedule
    let transfers = plan_transfers(&load_config, &accounts, &mut rand::thread_rng())?;
    let planned_file = CsvWriter::<PlannedTransfer>::in_dir(&output_dir, "txs.planned", &run)?;
    planned_file.append_all(&transfers)?;

    // Funding
    let funding_monitor = GasPriceMonitor::new(
        oracle.clone(),
        load_config.funding_gas_tier.clone(),
        load_config.gas_update_interval(),
        &oracle_retry,
    )
    .await?;
    let load_gas_price = oracle_retry
        .run("oracle_gas_price", || oracle.gas_price(&load_config.gas_tier))
        .await?;
    let planner = FundingPlanner::new(
        gateway.clone(),
        ledger.clone(),
        load_config.clone(),
        settings.node.receipt_poll_interval(),
    );
    let estimate = planner.estimate(accounts.len(), &transfers, load_gas_price);
    info!(
        "Estimated cost {} ETH at {} gwei load gas price ({} ETH per tx)",
        format_ether(estimate.total()),
        wei_to_gwei(load_gas_price),
        format_ether(estimate.ether_per_tx)
    );

    if settings.funding.dry_run {
        info!("Dry run requested, stopping before funding");
        return Ok(());
    }

    if settings.funding.require_confirmation {
        let balance = gateway.get_balance(funder.address()).await?;
        let shown = estimate.clone();
        let confirmed = tokio::task::spawn_blocking(move || {
            confirm_spend(&shown, balance, &mut std::io::stdin().lock(), &mut std::io::stdout())
        })
        .await??;
        if !confirmed {
            info!("Funding not confirmed, exiting");
            return Ok(());
        }
    }

    let (funding_gas, funding_task) = funding_monitor.spawn();
    let funding = planner
        .fund(&funder, &accounts, &transfers, &funding_gas, &estimate)
        .await;
    funding_task.stop().await;
    let funding = funding.context("Funding failed")?;
    if !funding.skipped.is_empty() {
        warn!("{} accounts could not be funded", funding.skipped.len());
    }

    // Load phase
    let gas_monitor = GasPriceMonitor::new(
        oracle.clone(),
        load_config.gas_tier.clone(),
        load_config.gas_update_interval(),
        &oracle_retry,
    )
    .await?;
    let (gas, gas_task) = gas_monitor.spawn();

    let block_file = Arc::new(CsvWriter::<BlockStat>::in_dir(&output_dir, "blocks", &run)?);
    let block_monitor = BlockMonitor::new(
        gateway.clone(),
        block_file,
        load_config.block_update_interval(),
        settings.monitor.backfill_skipped_blocks,
    );
    let (blocks, block_task) = block_monitor.spawn();

    let tx_file = Arc::new(CsvWriter::<TxResult>::in_dir(&output_dir, "txs", &run)?);
    let latency_file = Arc::new(CsvWriter::<TxLatency>::in_dir(&output_dir, "txs.plus", &run)?);
    let dispatcher = RateDispatcher::new(
        gateway.clone(),
        ledger.clone(),
        gas,
        blocks,
        tx_file,
        latency_file,
        load_config.tx_per_sec,
        load_config.token_transfer_gas_limit,
        settings.node.receipt_poll_interval(),
    );

    let outcome = tokio::select! {
        result = dispatcher.run(&transfers) => Some(result),
        _ = shutdown_signal() => None,
    };

    if outcome.is_none() {
        warn!("Shutdown signal received, abandoning remaining load");
    }

    // Graceful shutdown
    block_task.stop().await;
    gas_task.stop().await;
    if let Some(h) = metrics_handle {
        h.abort();
    }

    if let Some(result) = outcome {
        let report = result.context("Load dispatch failed")?;
        info!(
            "Submitted {} load transactions ({} failed), last mined in block {:?}",
            report.submitted, report.failed, report.last_mined_block
        );
    }

    info!(
        "ethload stopped after {} RPC and {} oracle retries; results in {:?}",
        gateway.retries(),
        oracle_retry.retries(),
        output_dir
    );
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ethload=debug,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
