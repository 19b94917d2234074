// Operator CLI over the local migration artifacts: the durable mapping
// store and the reference-equivalence side file. Live migration runs are
// driven by embedding the library with real connectors; this binary covers
// the between-runs workflow (status, auditing, export).

use anyhow::Result;
use std::env;
use std::path::Path;

use ledger_bridge::{MappingStore, MigrationConfig, ReferenceMap};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = MigrationConfig::from_env()?;

    match args.get(1).map(String::as_str) {
        Some("status") => run_status(&config),
        Some("export") => run_export(&config, args.get(2).map(String::as_str)),
        Some("refs") => run_refs(&config),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("ledger-bridge v{}", ledger_bridge::VERSION);
    println!();
    println!("Usage:");
    println!("  ledger-bridge status          mapping store counts per entity kind");
    println!("  ledger-bridge export [PATH]   dump the mapping store to CSV");
    println!("  ledger-bridge refs            inspect the reference side file");
    println!();
    println!("Paths are taken from TRACKING_DB and REFERENCE_FILE (or .env).");
}

fn run_status(config: &MigrationConfig) -> Result<()> {
    println!("📦 Mapping store: {}", config.tracking_db.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !config.tracking_db.exists() {
        println!("(no store yet - nothing has been migrated)");
        return Ok(());
    }

    let store = MappingStore::open(&config.tracking_db)?;
    let counts = store.counts_by_kind()?;
    if counts.is_empty() {
        println!("(store is empty)");
        return Ok(());
    }

    let mut total = 0;
    for (kind, count) in &counts {
        println!("  {:<14} {}", kind, count);
        total += count;
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ {} mappings total", total);

    Ok(())
}

fn run_export(config: &MigrationConfig, path: Option<&str>) -> Result<()> {
    let out = path.unwrap_or("mappings_export.csv");

    let store = MappingStore::open(&config.tracking_db)?;
    let rows = store.export_csv(Path::new(out))?;
    println!("✓ Exported {} mappings to {}", rows, out);

    Ok(())
}

fn run_refs(config: &MigrationConfig) -> Result<()> {
    println!("🔗 Reference file: {}", config.reference_file.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !config.reference_file.exists() {
        println!("(no reference file - run a mapping session first)");
        return Ok(());
    }

    let map = ReferenceMap::load(&config.reference_file)?;
    println!("  {}", map.summary());

    if !map.unmatched.is_empty() {
        println!("\nUnmatched source entities:");
        for entry in &map.unmatched {
            println!(
                "  [{}] {} '{}' (key {})",
                entry.kind.as_str(),
                entry.source_id,
                entry.name,
                entry.match_key
            );
        }
    }

    if !map.ambiguous.is_empty() {
        println!("\nAmbiguous matches (first candidate kept):");
        for entry in &map.ambiguous {
            println!(
                "  [{}] {} '{}' -> {} (candidates {:?})",
                entry.kind.as_str(),
                entry.source_id,
                entry.name,
                entry.chosen,
                entry.candidates
            );
        }
    }

    Ok(())
}
