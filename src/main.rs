use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

use slotshare::{
    config::{
        AddCustomerArgs, AddServerArgs, AttachArgs, Cli, Command, Config, OffersArgs, QuoteArgs,
        RevokeArgs,
    },
    credentials::{CredentialCipher, PlaintextCipher},
    domain::{ClassCounts, validate_monthly_price},
    engine::{
        AttachRequest, OfferQuery, Snapshot, attach_customer, compute_offers, register_customer,
    },
    pricing::pro_rata_quote,
    revocation::{RevocationTarget, revoke},
    state::{JsonSnapshotStore, NewCustomer, StoreInit},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Offers(args) => print_offers(&cli.config, args).await,
        Command::Quote(args) => print_quote(&cli.config, args),
        Command::AddServer(args) => add_server(&cli.config, args),
        Command::AddCustomer(args) => add_customer(&cli.config, args).await,
        Command::Attach(args) => attach(&cli.config, args).await,
        Command::Revoke(args) => revoke_group(&cli.config, args).await,
    }
}

fn open_store(config: &Config) -> Result<JsonSnapshotStore> {
    Ok(JsonSnapshotStore::load_or_init(StoreInit {
        data_dir: config.data_dir.clone(),
    })?)
}

// Stored credentials are read as-is until a keyed cipher is configured.
fn cipher() -> Arc<dyn CredentialCipher> {
    Arc::new(PlaintextCipher)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_offers(config: &Config, args: OffersArgs) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = Snapshot::read(&store, &args.tenant);
    let query = OfferQuery {
        server_id: args.server,
        plan_days: args.plan_days,
    };
    let report = compute_offers(&snapshot, cipher().as_ref(), &query, config.today()).await;
    print_json(&report)
}

fn print_quote(config: &Config, args: QuoteArgs) -> Result<()> {
    validate_monthly_price(args.monthly_price)?;
    print_json(&pro_rata_quote(args.monthly_price, config.today()))
}

fn add_server(config: &Config, args: AddServerArgs) -> Result<()> {
    let mut store = open_store(config)?;
    let server = store.create_server(
        args.tenant,
        args.server_name,
        ClassCounts::new(args.slots_a, args.slots_b),
        args.monthly_price,
    )?;
    info!(server_id = server.server_id, "server registered");
    print_json(&server)
}

async fn add_customer(config: &Config, args: AddCustomerArgs) -> Result<()> {
    let store = Mutex::new(open_store(config)?);
    let customer = register_customer(
        &store,
        cipher().as_ref(),
        NewCustomer {
            tenant_id: args.tenant,
            server_id: args.server,
            service_class: args.service_class,
            login: args.login,
            password: args.password,
            expires_on: args.expires_on,
            display_name: args.display_name,
        },
    )
    .await?;
    print_json(&customer)
}

async fn attach(config: &Config, args: AttachArgs) -> Result<()> {
    let store = Mutex::new(open_store(config)?);
    let attached = attach_customer(
        &store,
        cipher().as_ref(),
        AttachRequest {
            tenant_id: args.tenant,
            server_id: args.server,
            login: args.login,
            password: args.password,
            service_class: args.service_class,
            display_name: args.display_name,
        },
        config.today(),
    )
    .await?;
    print_json(&attached)
}

async fn revoke_group(config: &Config, args: RevokeArgs) -> Result<()> {
    let store = Mutex::new(open_store(config)?);
    let target = RevocationTarget {
        server_id: args.server,
        login: args.login,
        password: args.password,
    };
    let outcome = revoke(&store, cipher().as_ref(), &args.tenant, &target).await?;
    print_json(&outcome)
}

async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(Mutex::new(open_store(&config)?));

    let app = slotshare::http::build_router(config.clone(), store, cipher())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        "starting slotshare"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
