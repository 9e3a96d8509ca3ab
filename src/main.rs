use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use insee_geocoder::{init_tracing, pipeline, AppConfig, RunPaths};

/// Batch geocoder: joins an address table with the INSEE postal reference,
/// resolves coordinates through a cached geocoding service, re-checks
/// out-of-region hits, and renders the result as a standalone map.
#[derive(Debug, Parser)]
#[command(name = "insee-geocoder", version, about)]
struct Cli {
    /// CSV address table (columns: code_usine, Adresse, Code postal INSEE, Nom_de_la_commune)
    #[arg(long)]
    addresses: PathBuf,

    /// Semicolon-delimited postal reference (columns: #Code_commune_INSEE, Code_postal)
    #[arg(long = "postal-reference")]
    postal_reference: PathBuf,

    /// Directory for the enriched tables and the map artifact
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Geocode cache file, created on first run and reused afterwards
    #[arg(long, default_value = "geocache.csv")]
    cache: PathBuf,

    /// Skip writing the HTML map
    #[arg(long)]
    skip_map: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let paths = RunPaths {
        addresses: cli.addresses,
        postal_reference: cli.postal_reference,
        out_dir: cli.out_dir,
        cache_file: cli.cache,
        render_map: !cli.skip_map,
    };

    let stats = pipeline::run(&config, &paths)
        .await
        .context("geocoding run failed")?;

    println!(
        "{} rows: {} from cache, {} resolved online, {} corrected in refinement, {} unresolved",
        stats.total_rows,
        stats.cache_hits,
        stats.network_resolutions,
        stats.refine_corrected,
        stats.unresolved_final,
    );
    Ok(())
}
