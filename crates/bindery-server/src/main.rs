use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use bindery_core::capability::CapabilityAuthority;
use bindery_core::identity::{IdentityConfig, IdentityVerifier};
use bindery_core::session::{CreditLedger, NoopLedger, PublishService};
use bindery_core::store::{SessionStore, TtlPolicy};

use bindery_server::auth::{IntrospectionAuth, PrimaryAuth, StaticTokenAuth};
use bindery_server::credits::HttpCreditLedger;
use bindery_server::{start_server, AppState, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "bindery-server", about = "Publish-session attestation service")]
struct Args {
    /// Listen address.
    #[arg(long, env = "BINDERY_BIND", default_value = "127.0.0.1:8787")]
    bind: String,

    /// SQLite session-store path. Unset means in-memory (dev only).
    #[arg(long, env = "BINDERY_DB")]
    db: Option<PathBuf>,

    /// PKCS#8 PEM file with the Ed25519 capability signing key. Unset means a
    /// fresh keypair per process: issued tokens die with the process.
    #[arg(long, env = "BINDERY_CAPABILITY_KEY")]
    capability_key: Option<PathBuf>,

    /// Capability-token lifetime in hours.
    #[arg(long, env = "BINDERY_CAPABILITY_TTL_HOURS", default_value_t = 2)]
    capability_ttl_hours: i64,

    /// How long non-terminal sessions stay readable after their last write.
    #[arg(long, env = "BINDERY_ACTIVE_TTL_HOURS", default_value_t = 24)]
    active_ttl_hours: i64,

    /// How long terminal sessions stay readable after completion.
    #[arg(long, env = "BINDERY_TERMINAL_RETENTION_DAYS", default_value_t = 7)]
    terminal_retention_days: i64,

    /// Interval between physical purges of aged-out sessions.
    #[arg(long, env = "BINDERY_PURGE_INTERVAL_SECS", default_value_t = 3600)]
    purge_interval_secs: u64,

    /// Credit-ledger base URL. Unset means spends are not enforced.
    #[arg(long, env = "BINDERY_CREDITS_URL")]
    credits_url: Option<String>,

    /// Primary-session introspection endpoint.
    #[arg(long, env = "BINDERY_AUTH_INTROSPECT_URL")]
    auth_introspect_url: Option<String>,

    /// Static dev credential accepted on the initiate endpoint.
    #[arg(long, env = "BINDERY_DEV_TOKEN")]
    dev_token: Option<String>,

    /// User id bound to the static dev credential.
    #[arg(long, env = "BINDERY_DEV_USER", default_value = "dev-user")]
    dev_user: String,

    /// Include debug detail in error responses. Development only.
    #[arg(long)]
    dev_errors: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("fatal: {e:?}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let ttl = TtlPolicy::default()
        .with_active(chrono::Duration::hours(args.active_ttl_hours))
        .with_terminal_retention(chrono::Duration::days(args.terminal_retention_days));

    let store = Arc::new(match &args.db {
        Some(path) => SessionStore::open(path, ttl).context("open session store")?,
        None => {
            tracing::warn!("no --db configured; sessions live in memory only");
            SessionStore::in_memory(ttl).context("open in-memory session store")?
        }
    });

    let identity = IdentityVerifier::new(IdentityConfig::from_env())
        .context("identity verifier configuration")?;

    let capability = match &args.capability_key {
        Some(path) => {
            let pem = std::fs::read_to_string(path).context("read capability key PEM")?;
            CapabilityAuthority::from_pkcs8_pem(&pem).context("parse capability key")?
        }
        None => {
            tracing::warn!("no --capability-key configured; generating an ephemeral keypair");
            CapabilityAuthority::generate().context("generate capability keypair")?
        }
    }
    .with_ttl(chrono::Duration::hours(args.capability_ttl_hours));

    let ledger: Arc<dyn CreditLedger> = match &args.credits_url {
        Some(url) => Arc::new(HttpCreditLedger::new(url.clone()).context("credit ledger client")?),
        None => {
            tracing::warn!("no --credits-url configured; publish spends are not enforced");
            Arc::new(NoopLedger)
        }
    };

    let auth: Arc<dyn PrimaryAuth> = match (&args.auth_introspect_url, &args.dev_token) {
        (Some(url), _) => Arc::new(IntrospectionAuth::new(url.clone())?),
        (None, Some(token)) => {
            tracing::warn!("using static dev credential for primary-session auth");
            Arc::new(StaticTokenAuth::new(token.clone(), args.dev_user.clone()))
        }
        (None, None) => anyhow::bail!(
            "configure BINDERY_AUTH_INTROSPECT_URL or BINDERY_DEV_TOKEN for the initiate endpoint"
        ),
    };

    let service = PublishService::new(Arc::clone(&store), identity, capability, ledger);
    let state = Arc::new(AppState::new(service, auth).with_dev_errors(args.dev_errors));

    // Aged-out sessions are reclassified at read time; this task only
    // reclaims the rows afterwards.
    let purge_store = Arc::clone(&store);
    let purge_every = Duration::from_secs(args.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_every);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if let Err(e) = purge_store.purge_expired() {
                tracing::warn!(error = %e, "session purge failed");
            }
        }
    });

    start_server(
        state,
        ServerConfig {
            bind_addr: args.bind,
        },
    )
    .await
    .context("serve")
}
