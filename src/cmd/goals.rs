use std::io::Write;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::ArgMatches;
use rust_decimal::Decimal;
use tabwriter::TabWriter;

use crate::core::goal::{Goal, GoalStatus};
use crate::core::money;
use crate::settings::Settings;
use crate::store::SqliteStore;

fn parse_amount(raw: &str) -> Result<i64> {
    let amount = raw
        .parse::<Decimal>()
        .map_err(|_| anyhow!("{raw} is not a valid amount"))?;

    money::to_miliunits(amount).ok_or_else(|| anyhow!("{raw} is out of range"))
}

fn print_goals<T: Write>(wr: T, goals: &[Goal]) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Goal\tTarget\tSaved\tProgress\tStatus")?;

    for goal in goals.iter() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}%\t{}",
            goal.name,
            money::from_miliunits(goal.target_miliunits),
            money::from_miliunits(goal.current_miliunits),
            goal.progress_percent(),
            match goal.status {
                GoalStatus::Active => "active",
                GoalStatus::Completed => "completed",
            },
        )?;
    }

    tw.flush()?;

    Ok(())
}

async fn list(settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let goals = store.goals().list(&settings.default_user).await?;

    print_goals(std::io::stdout(), &goals)?;

    Ok(())
}

async fn create(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    // SAFETY: both arguments are positional and required, clap rejects the
    // command without them.
    let name = matches.value_of("name").unwrap();
    let target = parse_amount(matches.value_of("target").unwrap())?;

    let goal = store
        .goals()
        .create(&settings.default_user, name, target, Utc::now())
        .await?;

    println!("created goal {} ({})", goal.name, goal.id);

    Ok(())
}

async fn contribute(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let goal_id = matches.value_of("goal_id").unwrap();
    let amount = parse_amount(matches.value_of("amount").unwrap())?;

    let outcome = store.goals().contribute(goal_id, amount, Utc::now()).await?;

    println!(
        "{}: {} of {} saved ({}%)",
        outcome.goal.name,
        money::from_miliunits(outcome.goal.current_miliunits),
        money::from_miliunits(outcome.goal.target_miliunits),
        outcome.goal.progress_percent(),
    );
    for percent in &outcome.crossed {
        println!("milestone reached: {percent}%");
    }
    if outcome.goal.status == GoalStatus::Completed {
        println!("goal completed!");
    }

    Ok(())
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("create", create_matches)) => create(create_matches, settings).await,
        Some(("contribute", contribute_matches)) => contribute(contribute_matches, settings).await,
        _ => list(settings).await,
    }
}
