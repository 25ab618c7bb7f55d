// ============================================================================
// tiergate: committee governance and payment admission from the shell
// ============================================================================
// Usage:
//   tiergate stats                                  Show database statistics
//   tiergate params [--param-version N | --at TS]   Show a parameter version
//   tiergate seat --member ID --seat N              Seat a committee member
//   tiergate propose --title T --proposer P --set Silver.min_amount=15
//   tiergate vote --id 1 --member ID --choice approve
//   tiergate tick                                   Drive timers and executions
//   tiergate admit --payer W --amount L --tx SIG --nonce N
//   tiergate export --format json                   Export full state as JSON
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tiergate_core::{
    LedgerOracle, MajorityRule, ParamChange, ParamValue, ParameterSet, PaymentProof,
    ProposalStatus, ProposalSubmission, RpcLedgerOracle, StaticOracle, TierGate, TierGateConfig,
    VoteChoice,
};
use tracing::{debug, info};

/// Governed tiered access control
#[derive(Parser)]
#[command(name = "tiergate", version, about = "Committee-governed tiered access gateway")]
struct Cli {
    /// Path to the database file (default: ~/.tiergate/tiergate.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Accept every payment proof without asking the ledger oracle
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics
    Stats,

    /// Show the current parameter set, or a historical one
    Params {
        #[arg(long = "param-version", conflicts_with = "at")]
        param_version: Option<u64>,
        /// Unix timestamp; shows the version in effect at that time
        #[arg(long)]
        at: Option<i64>,
    },

    /// List every published parameter version
    History,

    /// List committee members
    Members,

    /// Seat a committee member
    Seat {
        #[arg(long)]
        member: String,
        #[arg(long)]
        seat: u8,
        /// Term length in days, starting now
        #[arg(long, default_value = "365")]
        term_days: i64,
    },

    /// Retire the occupant of a seat
    Vacate {
        #[arg(long)]
        seat: u8,
    },

    /// Submit (or draft) a parameter change proposal
    Propose {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        proposer: String,
        /// simple or supermajority
        #[arg(long, default_value = "supermajority")]
        majority: String,
        /// KEY=VALUE; repeatable
        #[arg(long = "set")]
        set: Vec<String>,
        /// KEY; repeatable
        #[arg(long = "unset")]
        unset: Vec<String>,
        /// Store as a draft without starting review
        #[arg(long)]
        draft: bool,
    },

    /// Submit a stored draft
    SubmitDraft {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        proposer: String,
    },

    /// Withdraw a proposal before voting opens
    Withdraw {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        proposer: String,
    },

    /// Attach a review comment
    Comment {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        member: String,
        #[arg(long)]
        body: String,
    },

    /// Cast or change a vote
    Vote {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        member: String,
        /// approve, reject or abstain
        #[arg(long)]
        choice: String,
    },

    /// Close a voting window now
    Close {
        #[arg(long)]
        id: u64,
    },

    /// Advance timers, retry executions and purge spent grants
    Tick,

    /// Run the maintenance scheduler until interrupted
    Serve {
        /// Seconds between passes (default: TIERGATE_SCHEDULER_INTERVAL_SECS or 30)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List proposals with optional status filter
    Proposals {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one proposal in full
    Show {
        #[arg(long)]
        id: u64,
    },

    /// Verify a payment and issue a grant
    Admit {
        #[arg(long)]
        payer: String,
        /// Amount in the asset's smallest unit (lamports for SOL)
        #[arg(long)]
        amount: u64,
        #[arg(long, default_value = "SOL")]
        asset: String,
        /// Transaction signature
        #[arg(long)]
        tx: String,
        #[arg(long)]
        nonce: String,
    },

    /// Use a capability against a grant token
    Authorize {
        #[arg(long)]
        token: String,
        #[arg(long)]
        capability: String,
    },

    /// List consumed settlements
    Ledger,

    /// List outstanding grants
    Grants,

    /// Export full state as JSON
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn parse_majority(s: &str) -> Result<MajorityRule> {
    match s.to_lowercase().as_str() {
        "simple" => Ok(MajorityRule::Simple),
        "super" | "supermajority" => Ok(MajorityRule::Supermajority),
        _ => anyhow::bail!("Unknown majority '{}'. Valid values: simple, supermajority", s),
    }
}

fn parse_changes(set: &[String], unset: &[String]) -> Result<Vec<ParamChange>> {
    let mut changes = Vec::with_capacity(set.len() + unset.len());
    for pair in set {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
        changes.push(ParamChange::set(key.trim(), value.parse::<ParamValue>()?));
    }
    for key in unset {
        changes.push(ParamChange::unset(key.trim()));
    }
    Ok(changes)
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tiergate_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = TierGateConfig::from_env()?;
    if cli.db_path.is_some() {
        config.db_path = cli.db_path.clone();
    }

    let oracle: Arc<dyn LedgerOracle> = if cli.offline {
        Arc::new(StaticOracle::trusting())
    } else {
        let rpc = RpcLedgerOracle::new(
            &config.gateway.oracle_url,
            Duration::from_millis(config.gateway.oracle_timeout_ms),
        )?;
        debug!("Verifying payments against {}", rpc.rpc_url());
        Arc::new(rpc)
    };
    let gate = Arc::new(TierGate::open(config, oracle)?);

    match cli.command {
        Commands::Stats => cmd_stats(&gate),
        Commands::Params { param_version, at } => cmd_params(&gate, param_version, at),
        Commands::History => cmd_history(&gate),
        Commands::Members => cmd_members(&gate),
        Commands::Seat {
            member,
            seat,
            term_days,
        } => cmd_seat(&gate, &member, seat, term_days),
        Commands::Vacate { seat } => {
            let retired = gate.engine().vacate_seat(seat)?;
            println!("Seat {} vacated ({})", seat, retired.member_id);
            Ok(())
        }
        Commands::Propose {
            title,
            body,
            proposer,
            majority,
            set,
            unset,
            draft,
        } => {
            let submission = ProposalSubmission {
                title,
                body,
                changes: parse_changes(&set, &unset)?,
                majority: parse_majority(&majority)?,
                proposer,
            };
            let id = if draft {
                gate.engine().draft(submission)?
            } else {
                gate.engine().submit(submission)?
            };
            println!("Proposal #{} {}", id, if draft { "drafted" } else { "submitted" });
            Ok(())
        }
        Commands::SubmitDraft { id, proposer } => {
            gate.engine().submit_draft(id, &proposer)?;
            println!("Proposal #{} submitted", id);
            Ok(())
        }
        Commands::Withdraw { id, proposer } => {
            gate.engine().withdraw(id, &proposer)?;
            println!("Proposal #{} withdrawn", id);
            Ok(())
        }
        Commands::Comment { id, member, body } => {
            gate.engine().comment(id, &member, &body)?;
            println!("Comment recorded on #{}", id);
            Ok(())
        }
        Commands::Vote { id, member, choice } => {
            let choice = VoteChoice::parse(&choice)
                .ok_or_else(|| anyhow!("Unknown choice '{}'. Valid values: approve, reject, abstain", choice))?;
            gate.engine().cast_vote(id, &member, choice)?;
            println!("{} voted {:?} on #{}", member, choice, id);
            Ok(())
        }
        Commands::Close { id } => {
            let status = gate.engine().close_voting(id)?;
            println!("Proposal #{}: {:?}", id, status);
            Ok(())
        }
        Commands::Tick => {
            let report = gate.run_maintenance()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Serve { interval } => {
            let secs = interval.unwrap_or(gate.config().scheduler_interval_secs).max(1);
            let handle = gate.spawn_scheduler(Duration::from_secs(secs));
            tokio::signal::ctrl_c().await?;
            handle.abort();
            info!("Scheduler stopped");
            Ok(())
        }
        Commands::Proposals { status } => cmd_proposals(&gate, status),
        Commands::Show { id } => {
            let proposal = gate
                .engine()
                .proposal(id)
                .ok_or_else(|| anyhow!("Unknown proposal #{}", id))?;
            println!("{}", serde_json::to_string_pretty(&proposal)?);
            Ok(())
        }
        Commands::Admit {
            payer,
            amount,
            asset,
            tx,
            nonce,
        } => {
            let proof = PaymentProof {
                payer,
                amount,
                asset,
                tx_reference: tx,
                nonce,
                timestamp: Utc::now().timestamp(),
            };
            let grant = gate.gateway().verify_and_admit(&proof).await?;
            println!("{}", serde_json::to_string_pretty(&grant)?);
            Ok(())
        }
        Commands::Authorize { token, capability } => {
            let grant = gate.gateway().authorize(&token, &capability)?;
            println!(
                "Authorized '{}' on tier {} ({} uses, consumed: {})",
                capability, grant.tier.id, grant.uses, grant.consumed
            );
            Ok(())
        }
        Commands::Ledger => cmd_ledger(&gate),
        Commands::Grants => {
            println!("{}", serde_json::to_string_pretty(&gate.gateway().grants())?);
            Ok(())
        }
        Commands::Export { format } => cmd_export(&gate, &format),
    }
}

fn cmd_stats(gate: &TierGate) -> Result<()> {
    let stats = gate
        .stats()?
        .ok_or_else(|| anyhow!("No database attached"))?;

    println!("=== TierGate Database Stats ===");
    println!();
    println!("Members:     {}", stats.total_members);
    println!("Proposals:   {} total", stats.total_proposals);
    for (status, count) in &stats.proposal_counts {
        println!("  {:14} {}", status, count);
    }
    println!("Parameters:  {} versions", stats.param_versions);
    println!("Settlements: {}", stats.total_settlements);
    println!("Grants:      {}", stats.total_grants);

    Ok(())
}

fn print_param_set(set: &ParameterSet) {
    println!(
        "Version {} (effective {}, {})",
        set.version(),
        format_timestamp(set.effective_at()),
        set.provenance()
            .map(|p| format!("proposal #{}", p))
            .unwrap_or_else(|| "genesis".to_string())
    );
    println!();
    println!("{:<16}  {:>14}  {:>8}  {:>6}  {}", "TIER", "MIN AMOUNT", "TTL", "USES", "CAPABILITIES");
    println!("{}", "-".repeat(80));
    for tier in set.tiers() {
        println!(
            "{:<16}  {:>14}  {:>8}  {:>6}  {}",
            tier.id,
            tier.min_amount,
            tier.grant_policy.ttl_secs,
            tier.grant_policy.max_uses,
            tier.capabilities.iter().cloned().collect::<Vec<_>>().join(",")
        );
    }
    for (key, value) in set.values().iter().filter(|(k, _)| !k.contains('.')) {
        println!("{} = {}", key, value);
    }
}

fn cmd_params(gate: &TierGate, version: Option<u64>, at: Option<i64>) -> Result<()> {
    let set = match (version, at) {
        (Some(v), _) => gate
            .params()
            .version(v)
            .ok_or_else(|| anyhow!("No parameter version {}", v))?,
        (None, Some(ts)) => gate
            .params()
            .version_at(ts)
            .ok_or_else(|| anyhow!("No parameters in effect at {}", format_timestamp(ts)))?,
        (None, None) => gate.params().current_version(),
    };
    print_param_set(&set);
    Ok(())
}

fn cmd_history(gate: &TierGate) -> Result<()> {
    println!("{:<8}  {:<24}  {}", "VERSION", "EFFECTIVE", "PROVENANCE");
    println!("{}", "-".repeat(60));
    for set in gate.params().history() {
        println!(
            "{:<8}  {:<24}  {}",
            set.version(),
            format_timestamp(set.effective_at()),
            set.provenance()
                .map(|p| format!("#{}", p))
                .unwrap_or_else(|| "genesis".to_string())
        );
    }
    Ok(())
}

fn cmd_members(gate: &TierGate) -> Result<()> {
    let members = gate.engine().roster();
    if members.is_empty() {
        println!("No members seated.");
        return Ok(());
    }

    println!("{:<6}  {:<24}  {:<24}  {:<24}  {}", "SEAT", "MEMBER", "TERM START", "TERM END", "ACTIVE");
    println!("{}", "-".repeat(96));
    for m in &members {
        println!(
            "{:<6}  {:<24}  {:<24}  {:<24}  {}",
            m.seat,
            m.member_id,
            format_timestamp(m.term_start),
            format_timestamp(m.term_end),
            m.active
        );
    }
    Ok(())
}

fn cmd_seat(gate: &TierGate, member: &str, seat: u8, term_days: i64) -> Result<()> {
    if term_days <= 0 {
        anyhow::bail!("--term-days must be positive");
    }
    let start = Utc::now().timestamp();
    let seated = gate
        .engine()
        .seat_member(member, seat, start, start + term_days * 86_400)?;
    println!(
        "Seated {} in seat {} until {}",
        seated.member_id,
        seated.seat,
        format_timestamp(seated.term_end)
    );
    Ok(())
}

fn cmd_proposals(gate: &TierGate, status_filter: Option<String>) -> Result<()> {
    let filter = status_filter
        .as_deref()
        .map(|s| ProposalStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
        .transpose()?;
    let proposals = gate.engine().proposals(filter);

    if proposals.is_empty() {
        println!("No proposals found.");
        return Ok(());
    }

    println!("{:<6}  {:<12}  {:<14}  {:<22}  {}", "ID", "STATUS", "MAJORITY", "CREATED AT", "TITLE");
    println!("{}", "-".repeat(90));
    for p in &proposals {
        let title = p.title.chars().take(30).collect::<String>();
        println!(
            "{:<6}  {:<12}  {:<14}  {:<22}  {}",
            p.id,
            format!("{:?}", p.status),
            format!("{:?}", p.majority),
            format_timestamp(p.created_at),
            title
        );
    }

    println!("\nTotal: {} proposals", proposals.len());
    Ok(())
}

fn cmd_ledger(gate: &TierGate) -> Result<()> {
    let records = gate.ledger().records();
    if records.is_empty() {
        println!("No settlements recorded.");
        return Ok(());
    }

    println!("{:<22}  {:<44}  {:>14}  {:<8}  {}", "CONSUMED AT", "SETTLEMENT", "AMOUNT", "VERSION", "GRANT");
    println!("{}", "-".repeat(120));
    for r in &records {
        println!(
            "{:<22}  {:<44}  {:>14}  {:<8}  {}",
            format_timestamp(r.consumed_at),
            r.key.to_string(),
            r.amount,
            r.param_version,
            r.grant_id
        );
    }
    println!("\nTotal: {} settlements", records.len());
    Ok(())
}

fn cmd_export(gate: &TierGate, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let history: Vec<ParameterSet> = gate
        .params()
        .history()
        .iter()
        .map(|set| set.as_ref().clone())
        .collect();

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": gate.stats()?,
        "members": gate.engine().roster(),
        "proposals": gate.engine().proposals(None),
        "locks": gate.engine().locked_keys(),
        "parameters": history,
        "settlements": gate.ledger().records(),
        "grants": gate.gateway().grants(),
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
