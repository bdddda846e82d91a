//! Conduit demo node: starts a broker with the `users` and `products`
//! services and walks through a registration/login/listing session.

use std::sync::Arc;

use clap::Parser;
use conduit_server::security::SaltedSha256Hasher;
use conduit_server::service::domain::users::UNIQUE_FIELDS;
use conduit_server::service::domain::{ProductsService, UsersService};
use conduit_server::storage::MemoryEntityStore;
use conduit_server::{ActionError, ErrorPayload, ServerConfig, ServiceBroker, ServiceContext};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Conduit service broker node.
#[derive(Parser, Debug)]
#[command(name = "conduit-node", about = "Runs a Conduit broker with the demo services")]
struct Cli {
    /// Broker node identifier.
    #[arg(long, env = "CONDUIT_NODE_ID", default_value = "conduit-node-1")]
    node_id: String,

    /// Secret used to sign access tokens.
    #[arg(long, env = "JWT_SECRET", default_value = "jwt-conduit-secret", hide_env_values = true)]
    jwt_secret: String,

    /// Default call timeout in milliseconds.
    #[arg(long, env = "CONDUIT_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    call_timeout_ms: u64,

    /// Concurrent calls allowed before shedding load.
    #[arg(long, env = "CONDUIT_MAX_CONCURRENT_CALLS", default_value_t = 1000)]
    max_concurrent_calls: u32,

    /// Interval between expired cache entry sweeps in milliseconds.
    #[arg(long, env = "CONDUIT_SWEEP_INTERVAL_MS", default_value_t = 60_000)]
    sweep_interval_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Keep running after the demo session until Ctrl+C.
    #[arg(long)]
    serve: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            node_id: self.node_id.clone(),
            jwt_secret: self.jwt_secret.clone(),
            default_call_timeout_ms: self.call_timeout_ms,
            max_concurrent_calls: self.max_concurrent_calls,
            cache_sweep_interval_ms: self.sweep_interval_ms,
            ..ServerConfig::default()
        }
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn render(label: &str, result: &Result<Value, ActionError>) {
    let body = match result {
        Ok(value) => value.clone(),
        Err(err) => json!({ "error": ErrorPayload::from(err) }),
    };
    println!("{label}: {body:#}");
}

async fn demo_session(broker: &ServiceBroker) {
    let created = broker
        .call(
            "users",
            "create",
            json!({ "user": {
                "username": "ann",
                "email": "ann@example.com",
                "password": "secret123",
            }}),
            None,
        )
        .await;
    render("users.create", &created);

    let duplicate = broker
        .call(
            "users",
            "create",
            json!({ "user": {
                "username": "ann",
                "email": "other@example.com",
                "password": "secret123",
            }}),
            None,
        )
        .await;
    render("users.create (duplicate)", &duplicate);

    let login = broker
        .call(
            "users",
            "login",
            json!({ "user": { "email": "ann@example.com", "password": "secret123" }}),
            None,
        )
        .await;
    render("users.login", &login);

    let token = login
        .as_ref()
        .ok()
        .and_then(|body| body["user"]["token"].as_str())
        .map(str::to_string);
    let Some(token) = token else {
        warn!("login did not yield a token, skipping authenticated calls");
        return;
    };

    render(
        "users.resolveToken",
        &broker
            .call("users", "resolveToken", json!({ "token": token }), None)
            .await,
    );
    render(
        "users.list",
        &broker.call("users", "list", json!({}), Some(&token)).await,
    );
    render(
        "users.list (anonymous)",
        &broker.call("users", "list", json!({}), None).await,
    );
    render(
        "products.listProducts",
        &broker.call("products", "listProducts", json!({}), None).await,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = cli.server_config();
    info!(?config, "starting conduit node");

    let ctx = ServiceContext::new(config);
    let users = UsersService::new(
        &ctx,
        Arc::new(MemoryEntityStore::new().with_unique_fields(UNIQUE_FIELDS.map(|(field, _)| field))),
        Arc::new(SaltedSha256Hasher::default()),
    );
    let mut broker = ServiceBroker::new(ctx);
    broker.register(users)?;
    broker.register(ProductsService)?;
    broker.start().await?;

    demo_session(&broker).await;
    broker.request_sweep().await?;

    if cli.serve {
        info!("demo finished, waiting for Ctrl+C");
        tokio::signal::ctrl_c().await?;
    }

    broker.stop().await
}
