//! `floe cache`: inspect and clear the compile cache.

use std::time::Duration;

use floe_cache::{CacheStats, CacheStore};

use crate::project::{open_store, resolve_project_root};
use crate::{CacheCommand, GlobalArgs};

const SECS_PER_DAY: u64 = 86_400;

/// Runs a `floe cache` subcommand against the project's cache directory.
pub fn run(
    command: &CacheCommand,
    global: &GlobalArgs,
) -> Result<i32, Box<dyn std::error::Error>> {
    let project_dir = resolve_project_root(global)?;
    let config = floe_manifest::load_project_config(&project_dir)?;
    let store = open_store(&project_dir, &config);

    match command {
        CacheCommand::Clear {
            category,
            older_than_days,
        } => {
            let older_than =
                older_than_days.map(|days| Duration::from_secs(u64::from(days) * SECS_PER_DAY));
            let removed = store.clear(*category, older_than)?;
            if !global.quiet {
                let scope = category.map_or_else(|| "all".to_string(), |c| c.to_string());
                eprintln!("   Removed {removed} {scope} cache entr{}", plural(removed));
            }
        }
        CacheCommand::Stats => {
            let stats = store.stats()?;
            println!("{}", render_stats(&stats));
        }
    }

    Ok(0)
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "y"
    } else {
        "ies"
    }
}

/// Renders a per-category table of entry counts, sizes, and oldest ages.
pub fn render_stats(stats: &CacheStats) -> String {
    let mut out = format!(
        "{:<10} {:>7} {:>10} {:>8}\n",
        "category", "entries", "size", "oldest"
    );
    for (category, cat) in &stats.categories {
        let oldest = cat.oldest_age.map_or_else(|| "-".to_string(), format_age);
        out.push_str(&format!(
            "{:<10} {:>7} {:>10} {:>8}\n",
            category.as_str(),
            cat.count,
            format_size(cat.total_size),
            oldest
        ));
    }
    let total_size: u64 = stats.categories.values().map(|c| c.total_size).sum();
    out.push_str(&format!(
        "{:<10} {:>7} {:>10}",
        "total",
        stats.total_count(),
        format_size(total_size)
    ));
    out
}

/// Formats a byte count using binary units.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Formats an age as the largest whole unit.
fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= SECS_PER_DAY {
        format!("{}d", secs / SECS_PER_DAY)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
