//! Settlement walkthrough
//!
//! Runs one settlement attempt against a scripted oracle and prints what a
//! payment modal would show at each step:
//!
//! 1. **Account issued**: masked account number and live countdown
//! 2. **Polling**: each status check as it happens
//! 3. **Outcome**: terminal message, plus masked/revealed tokens on success

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use colored::Colorize;
use settlement_core::{
    AttemptStatus, FieldKey, FlowKind, MemoryClipboard, OracleStatus, ScriptStep, ScriptedOracle,
    SecretString, SettlementConfig, SettlementEvent, SettlementOrchestrator, StatusReport,
    TokenMaterial, VendToken, VirtualAccountRequest,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "settlement-walkthrough")]
#[command(about = "Walk one payment attempt from account issue to confirmation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SETTLEMENT_CONFIG")]
    config: Option<String>,

    /// Flow preset: crypto, bank-transfer, key-change
    #[arg(short, long, default_value = "key-change")]
    flow: String,

    /// Scenario: confirm, exhaust, expire, manual
    #[arg(short, long, default_value = "confirm")]
    scenario: String,

    /// Override the poll interval so the walkthrough finishes quickly
    #[arg(long, default_value_t = 1_000)]
    interval_ms: u64,

    /// Log level
    #[arg(long, env = "SETTLEMENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json: bool,
}

fn header(title: &str) {
    println!();
    println!("{}", "═".repeat(72).cyan());
    println!("  {}", title.cyan().bold());
    println!("{}", "═".repeat(72).cyan());
}

fn demo_tokens() -> TokenMaterial {
    let token = |hex: &str, dec: &str, description: &str| VendToken {
        token_hex: SecretString::new(hex),
        token_dec: SecretString::new(dec),
        tid: "0231457".into(),
        drn: "600727".into(),
        krn: "1".into(),
        sgc: "999910".into(),
        ti: "01".into(),
        transfer_amount: None,
        pan: Some(SecretString::new("6007270123456789")),
        description: description.into(),
    };

    TokenMaterial::new(vec![
        token("4A9F02C1D77E3B10", "58213940175522019384", "Set first key"),
        token("91BB03E4A5C2F0D8", "10499382716650044721", "Set second key"),
    ])
}

fn scripted_oracle(scenario: &str) -> anyhow::Result<ScriptedOracle> {
    let confirmed = StatusReport::confirmed(Some(demo_tokens()));

    Ok(match scenario {
        "confirm" => ScriptedOracle::new()
            .pending_for(2)
            .with_checks([ScriptStep::error("gateway timeout")])
            .with_checks([ScriptStep::report(confirmed)]),
        "exhaust" => ScriptedOracle::new(),
        "expire" => ScriptedOracle::new().with_account_ttl(chrono::Duration::seconds(3)),
        "manual" => ScriptedOracle::new()
            .with_manual([ScriptStep::report(StatusReport {
                status: OracleStatus::Paid,
                ..confirmed
            })]),
        other => bail!("Unknown scenario: {}", other),
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<SettlementConfig> {
    let flow = match cli.flow.to_lowercase().as_str() {
        "crypto" => FlowKind::CryptoSettlement,
        "bank-transfer" | "bank" => FlowKind::BankTransfer,
        "key-change" | "key" => FlowKind::KeyChange,
        other => bail!("Unknown flow: {}", other),
    };

    let mut config = match cli.config.as_deref() {
        Some(path) => SettlementConfig::load(Some(path)).context("loading settlement config")?,
        None => SettlementConfig::for_flow(flow),
    };

    config.poll_interval_ms = cli.interval_ms;
    if cli.scenario == "exhaust" {
        config.max_attempts = config.max_attempts.min(4);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    let config = load_config(&cli)?;
    let oracle = Arc::new(scripted_oracle(&cli.scenario)?);
    let clipboard = Arc::new(MemoryClipboard::new());

    println!();
    println!("{}", "╔══════════════════════════════════════════════════════════════╗".cyan());
    println!(
        "{}",
        "║    Settlement Walkthrough                                    ║".cyan().bold()
    );
    println!("{}", "╚══════════════════════════════════════════════════════════════╝".cyan());

    // ── Part 1: Account issued ──────────────────────────────────────
    header("Part 1: Virtual account issued");

    let request = VirtualAccountRequest {
        amount_minor: 2_500_000,
        currency: "NGN".into(),
        payer_reference: "meter-0231457".into(),
        description: Some("Key change".into()),
    };
    let orchestrator =
        SettlementOrchestrator::open(&request, oracle.clone(), clipboard.clone(), config).await?;

    let account = orchestrator.account();
    let account_view = orchestrator.account_reveal();
    println!("  {} Bank:      {}", "├".dimmed(), account.bank_name.yellow());
    println!(
        "  {} Account:   {}",
        "├".dimmed(),
        account_view.view(&FieldKey::account_number())?.yellow()
    );
    println!("  {} Reference: {}", "├".dimmed(), account.reference);
    println!(
        "  {} Expires in {}",
        "└".dimmed(),
        orchestrator.snapshot().countdown.remaining_label.yellow()
    );

    // ── Part 2: Polling ─────────────────────────────────────────────
    header("Part 2: Waiting for settlement");

    let mut events = orchestrator.subscribe();
    orchestrator.start()?;

    if cli.scenario == "manual" {
        tokio::time::sleep(Duration::from_millis(cli.interval_ms + cli.interval_ms / 2)).await;
        println!("  {} {}", "├".dimmed(), "User pressed \"I have paid\"".bold());
        orchestrator.assert_paid()?;
    }

    loop {
        match events.recv().await {
            Ok(SettlementEvent::CheckStarted {
                attempt,
                max_attempts,
                ..
            }) => {
                let countdown = orchestrator.snapshot().countdown;
                println!(
                    "  {} Check {}/{} ({} left)",
                    "├".dimmed(),
                    attempt,
                    max_attempts,
                    countdown.remaining_label
                );
            }
            Ok(SettlementEvent::CheckCompleted { observed, .. }) => {
                println!("  {}   observed {}", "│".dimmed(), observed.to_string().yellow());
            }
            Ok(SettlementEvent::CheckErrored { error, .. }) => {
                println!("  {}   {}", "│".dimmed(), format!("transient: {}", error).dimmed());
            }
            Ok(SettlementEvent::Finished { status, message, .. }) => {
                let line = match status {
                    AttemptStatus::Confirmed => message.green().bold(),
                    AttemptStatus::Cancelled => message.yellow().bold(),
                    _ => message.red().bold(),
                };
                println!("  {} {}", "└".dimmed(), line);
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(RecvError::Closed) => bail!("settlement engine stopped unexpectedly"),
        }
    }

    // ── Part 3: Tokens ──────────────────────────────────────────────
    let Some(mut reveal) = orchestrator.reveal_session() else {
        println!();
        println!("  No tokens to reveal.");
        return Ok(());
    };

    header("Part 3: Token reveal");

    let first = FieldKey::token_dec(0);
    for state in reveal.states() {
        println!("  {} {:<16} {}", "├".dimmed(), state.key.to_string(), state.value.dimmed());
    }

    reveal.toggle_reveal(&first)?;
    println!("  {} Revealed {}: {}", "├".dimmed(), first, reveal.view(&first)?.green());

    reveal.copy_to_clipboard(&first)?;
    println!(
        "  {} Copied ({} chars on clipboard, ack showing: {})",
        "└".dimmed(),
        clipboard.contents().map(|c| c.char_len()).unwrap_or(0),
        reveal.is_copied(&first)
    );

    println!();
    println!(
        "  Oracle calls: {} status checks, {} manual verifications",
        oracle.check_calls(),
        oracle.manual_calls()
    );
    Ok(())
}
