use anyhow::Result;
use clap::ArgMatches;

use crate::categorize::{self, BatchOptions, HttpClassifier, WorkerStats};
use crate::settings::Settings;
use crate::store::SqliteStore;

async fn run_once(settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let classifier = HttpClassifier::new(
        settings.classifier.base_url.clone(),
        settings.classifier.api_key.clone(),
    );
    let opts = BatchOptions {
        min_batch: settings.classifier.batch_min,
        max_batch: settings.classifier.batch_max,
    };
    let mut stats = WorkerStats::default();

    let report = categorize::run_batch(&mut store, &classifier, &opts, &mut stats).await?;

    match report.retry_after {
        Some(reset) => println!(
            "classifier rate limited; {} transactions remain pending, retry in {}s",
            report.selected,
            reset.as_secs()
        ),
        None if report.selected < opts.min_batch => println!(
            "{} pending transactions is below the batch minimum of {}, nothing to do",
            report.selected, opts.min_batch
        ),
        None => println!(
            "classified {} of {} pending transactions",
            report.classified, report.selected
        ),
    }

    Ok(())
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("run", _)) => run_once(settings).await,
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }
}
