use anyhow::Result;
use clap::{arg, Command};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use bursar::cmd;
use bursar::settings::Settings;

fn app() -> Command<'static> {
    Command::new(bursar::APP_NAME)
        .about("The bursar service links bank accounts through an aggregation \
         provider, synchronizes accounts and transactions into a local store, \
         and hands uncategorized transactions to a classification worker.")
        .version("0.1.0")
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(arg!(CONFIG: -c --config [FILE] "Sets a custom config file"))
        .arg(arg!(verbose: -v --verbose "Sets the level of verbosity"))
        .subcommand(Command::new("init").about("Initialize the service configuration."))
        .subcommand(Command::new("serve")
            .about("Runs the HTTP API for token exchange, sync, and pending-categorization queries.")
            .arg(arg!(listen: -l --listen [ADDR] "Address to bind, defaults to the configured listen address.")))
        .subcommand(Command::new("link")
            .about("Links a new bank connection through the provider authorization flow.")
            .arg(arg!(port: -p --port [PORT] "Local port for the link flow server."))
            .subcommand(Command::new("status").about("Displays all connections and their current status."))
            .subcommand(Command::new("delete")
                .about("Soft-disconnects a bank connection, keeping its synced data.")
                .arg(arg!(connection_id: <CONNECTION_ID> "The provider connection ID to disconnect."))))
        .subcommand(Command::new("accounts")
            .about("Prints tracked accounts to stdout.")
            .subcommand(Command::new("balance")
                .about("Prints the latest synced balance snapshot for each account.")))
        .subcommand(Command::new("sync")
            .about("Pulls accounts and transactions for the user's bank connections.")
            .arg(arg!(user: -u --user [USER] "Sync on behalf of this user, defaults to the configured user."))
            .arg(arg!(force: -f --force "Re-walks the full transaction history instead of an incremental pull."))
            .arg(arg!(begin: --begin [DATE] "The first day of transactions to pull. Start date is inclusive."))
            .arg(arg!(until: --until [DATE] "The last day of transactions to pull, defaults to today. End date is inclusive.")))
        .subcommand(Command::new("categories")
            .about("Prints user-defined categories.")
            .subcommand(Command::new("add")
                .about("Creates a category.")
                .arg(arg!(name: <NAME> "A name for the category.")))
            .subcommand(Command::new("rename")
                .about("Renames a category.")
                .arg(arg!(category_id: <CATEGORY_ID> "The category to rename."))
                .arg(arg!(name: <NAME> "The new name.")))
            .subcommand(Command::new("rm")
                .about("Deletes a category and returns its transactions to the pending pool.")
                .arg(arg!(category_id: <CATEGORY_ID> "The category to delete."))))
        .subcommand(Command::new("goals")
            .about("Prints savings goals and their progress.")
            .subcommand(Command::new("create")
                .about("Creates a savings goal with percentage milestones.")
                .arg(arg!(name: <NAME> "A name for the goal."))
                .arg(arg!(target: <TARGET> "Target amount in display currency units.")))
            .subcommand(Command::new("contribute")
                .about("Records a contribution toward a goal.")
                .arg(arg!(goal_id: <GOAL_ID> "The goal to contribute to."))
                .arg(arg!(amount: <AMOUNT> "Contribution amount in display currency units."))))
        .subcommand(Command::new("categorize")
            .subcommand_required(true)
            .about("Categorization batch worker, intended to be triggered periodically.")
            .subcommand(Command::new("run").about("Runs one bounded classification batch.")))
}

async fn run() -> Result<()> {
    let matches = app().get_matches();

    let default_level = if matches.is_present("verbose") {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = matches.value_of("CONFIG");

    match matches.subcommand() {
        Some(("init", _)) => cmd::init::run(config).await,
        Some(("serve", serve_matches)) => cmd::serve::run(serve_matches, Settings::new(config)?).await,
        Some(("link", link_matches)) => cmd::link::run(link_matches, Settings::new(config)?).await,
        Some(("accounts", account_matches)) => {
            cmd::accounts::run(account_matches, Settings::new(config)?).await
        }
        Some(("sync", sync_matches)) => cmd::sync::run(sync_matches, Settings::new(config)?).await,
        Some(("categories", category_matches)) => {
            cmd::categories::run(category_matches, Settings::new(config)?).await
        }
        Some(("goals", goal_matches)) => cmd::goals::run(goal_matches, Settings::new(config)?).await,
        Some(("categorize", worker_matches)) => {
            cmd::worker::run(worker_matches, Settings::new(config)?).await
        }
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        println!("{:#}", err);
        std::process::exit(1);
    }
}
