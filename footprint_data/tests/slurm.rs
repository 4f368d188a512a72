use chrono::{Days, Local};
use color_eyre::Result;
use footprint_data::slurm::{AccountingSource as _, DateRange, Sacct, SacctTable};

fn are_we_on_slurm_machine() -> bool {
    let available = Sacct::is_available();
    if !available {
        eprintln!("No slurm found, SKIPPING");
    }
    available
}

#[test]
fn sacct_last_week() -> Result<()> {
    if !are_we_on_slurm_machine() {
        return Ok(());
    }
    // look if querying and parsing can happen without an error
    // if so, just print out the result, since we have no way to actually validate the data
    let today = Local::now().date_naive();
    let week_ago = today.checked_sub_days(Days::new(7)).unwrap_or(today);
    let raw = Sacct.fetch(DateRange::new(week_ago, today)?)?;
    let table = SacctTable::parse(&raw)?;
    println!("{} steps, AllocTRES: {}", table.steps.len(), table.has_alloc_tres);
    Ok(())
}
