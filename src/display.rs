use std::io::Write;

use anyhow::Result;
use tabwriter::TabWriter;

use crate::core::{money, Account, BalanceSnapshot};

pub fn print_accounts<T: Write>(wr: T, accounts: &[Account]) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Institution\tAccount\tExternal ID\tLast Synced")?;

    for account in accounts.iter() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}",
            account.institution,
            account.name,
            account.external_id,
            account
                .last_synced_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string()),
        )?;
    }

    tw.flush()?;

    Ok(())
}

pub fn print_balances<T: Write>(
    wr: T,
    rows: &[(Account, Option<BalanceSnapshot>)],
) -> Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Account\tCurrent\tAvailable\tCurrency\tAs Of")?;

    for (account, balance) in rows.iter() {
        match balance {
            Some(balance) => writeln!(
                tw,
                "{}\t{}\t{}\t{}\t{}",
                account.name,
                money::from_miliunits(balance.current_miliunits),
                balance
                    .available_miliunits
                    .map(|units| money::from_miliunits(units).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                balance.currency,
                balance.as_of.format("%Y-%m-%d %H:%M"),
            )?,
            None => writeln!(tw, "{}\t-\t-\t{}\t-", account.name, account.currency)?,
        }
    }

    tw.flush()?;

    Ok(())
}
