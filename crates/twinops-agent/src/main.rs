//! twinops-agent - safety-kernel agent for an AAS digital twin.
//!
//! The binary wires the component graph in dependency order (audit log,
//! policy store, shadow twin, twin client, kernel, approval store,
//! orchestrator), spawns the MQTT shadow feed, and then serves framed
//! requests: one JSON request per stdin line, one JSON reply per stdout
//! line. The HTTP front-end that normally produces those frames sits
//! outside this process.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use twinops_core::approval::ApprovalStore;
use twinops_core::audit::AuditLog;
use twinops_core::idempotency::{
    IdempotencyStore, MemoryIdempotencyStore, SqliteIdempotencyStore,
};
use twinops_core::kernel::{SafetyKernel, ToolExecutor};
use twinops_core::policy::{ed25519_verifier, PolicyStore};
use twinops_core::shadow::ShadowTwin;

use twinops_agent::catalog::ToolCatalog;
use twinops_agent::config::{IdempotencyBackend, Settings};
use twinops_agent::llm::rules::RulesSelector;
use twinops_agent::llm::ToolSelector;
use twinops_agent::orchestrator::{ChatRequest, Orchestrator};
use twinops_agent::twin::mqtt::run_shadow_feed;
use twinops_agent::twin::{CatalogExecutor, TwinClient, TwinClientConfig};

/// twinops agent - natural-language control of an AAS digital twin
/// behind a safety kernel.
#[derive(Parser, Debug)]
#[command(name = "twinops-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the audit log path from the environment
    #[arg(long)]
    audit_log: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the hash chain of an audit log file
    VerifyAudit {
        /// Path to the audit JSONL file
        path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Some(Command::VerifyAudit { path }) = &args.command {
        return verify_audit(path);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run_agent(args))
}

fn verify_audit(path: &str) -> Result<()> {
    let verification = AuditLog::verify(path).context("failed to read audit log")?;
    if verification.ok {
        println!("ok: {} entries, chain intact", verification.entries);
        Ok(())
    } else {
        println!(
            "BROKEN: chain breaks at seq {} ({} entries examined)",
            verification.first_break_seq.unwrap_or(0),
            verification.entries
        );
        std::process::exit(1);
    }
}

async fn run_agent(args: Args) -> Result<()> {
    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(path) = args.audit_log {
        settings.audit_log_path = path;
    }

    info!(
        twin = %settings.twin_base_url,
        aas = %settings.aas_id,
        "starting twinops agent"
    );

    // Audit first: nothing else may make a decision without it.
    let audit = Arc::new(
        AuditLog::open(&settings.audit_log_path).context("failed to open audit log")?,
    );

    let idempotency: Arc<dyn IdempotencyStore> = match settings.tool_idempotency_storage {
        IdempotencyBackend::Memory => Arc::new(MemoryIdempotencyStore::new(
            settings.tool_idempotency_ttl,
            settings.tool_idempotency_max_entries,
        )),
        IdempotencyBackend::Sqlite => Arc::new(
            SqliteIdempotencyStore::open(
                &settings.tool_idempotency_sqlite_path,
                settings.tool_idempotency_ttl,
            )
            .context("failed to open idempotency store")?,
        ),
    };

    let client = Arc::new(
        TwinClient::new(TwinClientConfig::from_settings(&settings), idempotency)
            .context("failed to build twin client")?,
    );

    // Policies only count when they verify against the key configured
    // here; running without one would disable the safety layer.
    let public_key = parse_public_key(settings.policy_public_key.as_deref())?;
    let policy = {
        let client = Arc::clone(&client);
        let submodel = settings.policy_submodel_id.clone();
        let element = settings.policy_element_path.clone();
        let fetcher = move || {
            let client = Arc::clone(&client);
            let submodel = submodel.clone();
            let element = element.clone();
            async move { client.fetch_signed_policy(&submodel, &element).await }
        };
        Arc::new(PolicyStore::new(
            Box::new(fetcher),
            ed25519_verifier(),
            public_key,
            settings.policy_cache_ttl,
            settings.policy_max_age,
        ))
    };

    // Seed the shadow and discover the tool catalog from the shell's
    // submodels.
    let submodels = match client.list_submodel_refs(&settings.aas_id).await {
        Ok(submodels) => submodels,
        Err(err) => {
            warn!(error = %err, "submodel discovery failed, starting with empty shadow");
            Vec::new()
        },
    };

    let shadow = Arc::new(ShadowTwin::new());
    let snapshot = client.snapshot(&submodels).await;
    if snapshot.is_empty() {
        warn!("initial shadow snapshot is empty");
    } else {
        shadow.apply_snapshot(snapshot);
    }

    let catalog = Arc::new(ToolCatalog::new(client.discover_tools(&submodels).await));
    info!(
        submodels = submodels.len(),
        tools = catalog.all().len(),
        "twin discovery complete"
    );

    let approvals = Arc::new(ApprovalStore::new(settings.approval_ttl));
    let executor: Arc<dyn ToolExecutor> =
        Arc::new(CatalogExecutor::new(Arc::clone(&client), Arc::clone(&catalog)));
    let kernel = SafetyKernel::new(
        policy,
        Arc::clone(&shadow),
        executor,
        Arc::clone(&audit),
        approvals,
        settings.interlock_fail_safe,
    );

    let selector: Arc<dyn ToolSelector> = Arc::new(RulesSelector::new());
    let orchestrator = Arc::new(
        Orchestrator::new(
            selector,
            catalog,
            kernel,
            Arc::clone(&audit),
            settings.capability_top_k,
            settings.llm_concurrency_limit,
            settings.tool_concurrency_limit,
        )
        .with_default_roles(settings.default_roles.clone()),
    );

    tokio::spawn(run_shadow_feed(
        settings.clone(),
        Arc::clone(&shadow),
        Arc::clone(&client),
        submodels,
    ));

    serve_frames(orchestrator).await
}

fn parse_public_key(hex_key: Option<&str>) -> Result<VerifyingKey> {
    let Some(hex_key) = hex_key else {
        bail!("TWINOPS_POLICY_PUBLIC_KEY is required: policies must verify against a known key");
    };
    let raw = hex::decode(hex_key).context("policy public key is not valid hex")?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| anyhow::anyhow!("policy public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&raw).context("policy public key is not a valid Ed25519 key")
}

/// A framed control message: a chat request by default, an approval
/// resolution when the frame carries `action`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Frame {
    Resolution {
        action: ResolutionAction,
        task_id: String,
        actor: String,
        #[serde(default)]
        roles: Vec<String>,
        #[serde(default)]
        reason: String,
    },
    Chat(ChatRequest),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResolutionAction {
    Approve,
    Reject,
}

/// Serves newline-delimited JSON frames on stdin/stdout until EOF or
/// shutdown signal.
async fn serve_frames(orchestrator: Arc<Orchestrator>) -> Result<()> {
    info!("agent ready, serving framed requests on stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("stdin read failed")?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        };
        let Some(line) = line else {
            info!("stdin closed, shutting down");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Chat(request)) => serde_json::to_value(orchestrator.process(&request).await),
            Ok(Frame::Resolution {
                action,
                task_id,
                actor,
                roles,
                reason,
            }) => match action {
                ResolutionAction::Approve => {
                    serde_json::to_value(orchestrator.approve(&task_id, &actor, &roles).await)
                },
                ResolutionAction::Reject => serde_json::to_value(
                    orchestrator.reject(&task_id, &actor, &roles, &reason).await,
                ),
            },
            Err(err) => serde_json::to_value(twinops_agent::error::ErrorEnvelope::new(
                twinops_agent::error::ErrorCode::InvalidJson,
                err.to_string(),
            )),
        }
        .context("reply serialization failed")?;

        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{reply}").context("stdout write failed")?;
        stdout.flush().context("stdout flush failed")?;
    }
}
