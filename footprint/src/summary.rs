//! Terminal rendering of a run's whole-run totals.

use footprint_data::{config::ClusterConfig, slurm::DateRange, Report};

/// g below 1 kg, kg below 1 t, t above
pub fn format_emissions(grams: f64) -> String {
    match grams.abs() {
        g if g < 1_000.0 => format!("{grams:.2} gCO2e"),
        g if g < 1_000_000.0 => format!("{:.2} kgCO2e", grams / 1_000.0),
        _ => format!("{:.2} tCO2e", grams / 1_000_000.0),
    }
}

pub fn print(report: &Report, config: &ClusterConfig, date_range: DateRange) {
    let total = &report.rollup.total;
    let energy = &total.energy;
    let emissions = &total.emissions;
    let failed_jobs = (total.job_count as u32).saturating_sub(total.successful_jobs);

    println!();
    println!("Footprint of {} jobs on {}, {} to {}", total.job_count, config.hpc_system, date_range.start, date_range.end);
    println!("  first job submitted {}, last {}", total.first_job_time, total.last_job_time);
    println!();
    println!("Energy");
    if report.counters_present {
        println!("  measured by energy counters:     {:.4} kWh", total.energy_counter_kwh);
    }
    println!("  estimated from usage:            {:.4} kWh (PUE {})", energy.total_kwh, config.pue);
    println!("    CPU:                           {:.4} kWh", energy.cpu_kwh);
    println!("    GPU:                           {:.4} kWh", energy.gpu_kwh);
    println!("    memory:                        {:.4} kWh", energy.memory_kwh);
    println!("    data centre overheads:         {:.4} kWh", energy.total_kwh - energy.total_no_pue_kwh);
    println!();
    println!("Emissions");
    println!("  scope 2 (usage estimate):        {}", format_emissions(emissions.scope2));
    if report.counters_present {
        println!("  scope 2 (energy counters):       {}", format_emissions(emissions.scope2_measured));
    }
    println!("  scope 3:                         {}", format_emissions(emissions.scope3));
    println!("  total:                           {}", format_emissions(emissions.total));
    println!("  mean carbon intensity:           {:.1} gCO2e/kWh", emissions.carbon_intensity);
    println!();
    println!("That is about");
    println!("  {:.2} miles driven by car", emissions.equivalents.driving_miles);
    println!("  {:.2} months of a tree absorbing CO2", emissions.equivalents.tree_months);
    println!("  {:.4} days of a UK household's electricity", emissions.equivalents.household_days);
    println!("  {:.4} flights from Bristol to Paris", emissions.equivalents.flights);
    println!();
    println!("Electricity cost: £{:.2} at {:.4} GBP/kWh", emissions.cost, config.electricity_cost);
    println!(
        "Failed jobs: {failed_jobs} ({:.1}%), {} of scope 2 emissions",
        total.failed_fraction * 100.0,
        format_emissions(emissions.scope2_failed)
    );
    println!(
        "Requested memory was {:.1}x what was needed, right-sizing it would avoid {}",
        total.wasted_memory_ratio,
        format_emissions(emissions.scope2 - emissions.scope2_required_memory)
    );
    if !report.diagnostics.is_empty() {
        println!();
        println!("{} warnings:", report.diagnostics.len());
        report.diagnostics.iter().for_each(|d| println!("  - {d}"));
    }
}
