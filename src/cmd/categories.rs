use std::io::Write;

use anyhow::Result;
use clap::ArgMatches;
use tabwriter::TabWriter;

use crate::core::Category;
use crate::settings::Settings;
use crate::store::SqliteStore;

fn print_categories<T: Write>(wr: T, categories: &[Category]) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "ID\tName")?;

    for category in categories.iter() {
        writeln!(tw, "{}\t{}", category.id, category.name)?;
    }

    tw.flush()?;

    Ok(())
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let user = settings.default_user.clone();

    match matches.subcommand() {
        Some(("add", add_matches)) => {
            let name = add_matches.value_of("name").unwrap();
            let category = store.categories().create(&user, name).await?;
            println!("created category {} ({})", category.name, category.id);
        }
        Some(("rename", rename_matches)) => {
            let id = rename_matches.value_of("category_id").unwrap();
            let name = rename_matches.value_of("name").unwrap();
            store.categories().rename(id, name).await?;
        }
        Some(("rm", rm_matches)) => {
            let id = rm_matches.value_of("category_id").unwrap();
            store.categories().delete(id).await?;
            println!("deleted category {id}; its transactions are pending again");
        }
        _ => {
            let categories = store.categories().list(&user).await?;
            print_categories(std::io::stdout(), &categories)?;
        }
    }

    Ok(())
}
