use std::{net::SocketAddr, path::PathBuf};

use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};

use crate::domain::ServiceClass;

pub const VERSION: &str = match option_env!("SLOTSHARE_BUILD_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "slotshare",
    about = "Shared-credential slot allocation and pro-rata pricing",
    version = VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the JSON API (default).
    Run,

    /// Print the slot offers available to a tenant.
    Offers(OffersArgs),

    /// Print the pro-rata charge for the rest of the current month.
    Quote(QuoteArgs),

    /// Register a server with its per-credential slot capacity.
    AddServer(AddServerArgs),

    /// Register a customer record with its own credential and expiration.
    AddCustomer(AddCustomerArgs),

    /// Attach a new customer to an existing shared credential.
    Attach(AttachArgs),

    /// Delete every customer sharing one credential on a server.
    Revoke(RevokeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct OffersArgs {
    #[arg(long, env = "SLOTSHARE_TENANT", value_name = "TENANT_ID")]
    pub tenant: String,

    #[arg(long, value_name = "SERVER_ID")]
    pub server: Option<String>,

    /// Nominal length of the plan being sold; only matching credentials are listed.
    #[arg(
        long = "plan-days",
        value_name = "DAYS",
        value_parser = clap::value_parser!(i64).range(0..=3660)
    )]
    pub plan_days: Option<i64>,
}

#[derive(Args, Debug, Clone)]
pub struct QuoteArgs {
    #[arg(long = "monthly-price", value_name = "AMOUNT")]
    pub monthly_price: f64,
}

#[derive(Args, Debug, Clone)]
pub struct AddServerArgs {
    #[arg(long, env = "SLOTSHARE_TENANT", value_name = "TENANT_ID")]
    pub tenant: String,

    #[arg(long = "name", value_name = "SERVER_NAME")]
    pub server_name: String,

    #[arg(long = "slots-a", value_name = "N", default_value_t = 0)]
    pub slots_a: u32,

    #[arg(long = "slots-b", value_name = "N", default_value_t = 0)]
    pub slots_b: u32,

    #[arg(long = "monthly-price", value_name = "AMOUNT")]
    pub monthly_price: Option<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct AddCustomerArgs {
    #[arg(long, env = "SLOTSHARE_TENANT", value_name = "TENANT_ID")]
    pub tenant: String,

    #[arg(long, value_name = "SERVER_ID")]
    pub server: String,

    #[arg(long, value_name = "LOGIN")]
    pub login: Option<String>,

    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    #[arg(long = "class", value_name = "CLASS", value_enum)]
    pub service_class: ServiceClass,

    #[arg(long = "expires", value_name = "YYYY-MM-DD")]
    pub expires_on: Option<NaiveDate>,

    #[arg(long = "name", value_name = "DISPLAY_NAME")]
    pub display_name: String,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    #[arg(long, env = "SLOTSHARE_TENANT", value_name = "TENANT_ID")]
    pub tenant: String,

    #[arg(long, value_name = "SERVER_ID")]
    pub server: String,

    #[arg(long, value_name = "LOGIN")]
    pub login: String,

    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,

    #[arg(long = "class", value_name = "CLASS", value_enum)]
    pub service_class: ServiceClass,

    #[arg(long = "name", value_name = "DISPLAY_NAME")]
    pub display_name: String,
}

#[derive(Args, Debug, Clone)]
pub struct RevokeArgs {
    #[arg(long, env = "SLOTSHARE_TENANT", value_name = "TENANT_ID")]
    pub tenant: String,

    #[arg(long, value_name = "SERVER_ID")]
    pub server: String,

    #[arg(long, value_name = "LOGIN")]
    pub login: String,

    #[arg(long, value_name = "PASSWORD")]
    pub password: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "SLOTSHARE_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:62480"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "SLOTSHARE_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Pin "today" instead of reading the local clock.
    #[arg(long, global = true, env = "SLOTSHARE_TODAY", value_name = "YYYY-MM-DD")]
    pub today: Option<NaiveDate>,
}

impl Config {
    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}
