use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::GeocodeCache;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::{GeocoderService, Resolution, ResolutionSource, Resolver};
use crate::ingestion::{AddressTable, PostalDirectory};
use crate::map::render_map;
use crate::refine::refine_out_of_region;
use crate::telemetry::TelemetryClient;

pub const OUT_WITH_POSTAL: &str = "addresses_with_postal.csv";
pub const OUT_GEOCODED: &str = "addresses_geocoded.csv";
pub const OUT_REFINED: &str = "addresses_refined.csv";
pub const OUT_MAP: &str = "map.html";

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub addresses: PathBuf,
    pub postal_reference: PathBuf,
    pub out_dir: PathBuf,
    pub cache_file: PathBuf,
    pub render_map: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunStats {
    pub total_rows: usize,
    pub joined: usize,
    pub skipped_prior: usize,
    pub cache_hits: usize,
    pub network_resolutions: usize,
    pub unresolved_base: usize,
    pub refine_examined: usize,
    pub refine_corrected: usize,
    pub unresolved_final: usize,
    pub plotted: usize,
}

/// Runs the whole batch: load + join, base resolution pass, refinement
/// pass, cache persistence and the map artifact. Input problems are fatal;
/// per-record resolution failures are logged and counted.
pub async fn run(config: &AppConfig, paths: &RunPaths) -> AppResult<RunStats> {
    fs::create_dir_all(&paths.out_dir)?;
    let telemetry = TelemetryClient::new(&paths.out_dir, config)?;

    let mut table = AddressTable::from_csv(&paths.addresses)?;
    let directory = PostalDirectory::from_csv(&paths.postal_reference)?;

    let mut stats = RunStats {
        total_rows: table.len(),
        ..RunStats::default()
    };
    stats.joined = table.join_postal(&directory);
    table.write_csv(paths.out_dir.join(OUT_WITH_POSTAL))?;
    info!(
        rows = stats.total_rows,
        joined = stats.joined,
        "postal join complete"
    );
    telemetry.record(
        "run_started",
        json!({ "rows": stats.total_rows, "joined": stats.joined }),
    )?;

    let mut cache = GeocodeCache::load(&paths.cache_file)?;
    let service = GeocoderService::new(config)?;
    let resolver = Resolver::with_service(service, config);

    base_pass(&mut table, &mut cache, &resolver, config, &mut stats).await;
    table.write_csv(paths.out_dir.join(OUT_GEOCODED))?;
    telemetry.record(
        "pass_completed",
        json!({
            "pass": "base",
            "cache_hits": stats.cache_hits,
            "network_resolutions": stats.network_resolutions,
            "unresolved": stats.unresolved_base,
        }),
    )?;

    let refined = refine_out_of_region(
        &mut table,
        &mut cache,
        &resolver,
        &config.region,
        &config.country,
    )
    .await?;
    stats.refine_examined = refined.examined;
    stats.refine_corrected = refined.corrected;
    stats.unresolved_final = table
        .records
        .iter()
        .filter(|record| record.coordinates.is_none())
        .count();
    table.write_csv(paths.out_dir.join(OUT_REFINED))?;
    telemetry.record(
        "pass_completed",
        json!({
            "pass": "refine",
            "examined": refined.examined,
            "corrected": refined.corrected,
            "unresolved": refined.unresolved,
        }),
    )?;

    cache.persist()?;

    if paths.render_map {
        stats.plotted = render_map(&table, paths.out_dir.join(OUT_MAP))?;
    }

    telemetry.record("run_completed", serde_json::to_value(stats)?)?;
    telemetry.flush()?;
    info!(?stats, "run complete");
    Ok(stats)
}

async fn base_pass(
    table: &mut AddressTable,
    cache: &mut GeocodeCache,
    resolver: &Resolver,
    config: &AppConfig,
    stats: &mut RunStats,
) {
    for record in &mut table.records {
        // Resume guard: rows resolved by an earlier run are not re-queried.
        if record.coordinates.is_some() {
            stats.skipped_prior += 1;
            continue;
        }

        let query = record.base_query(&config.country);
        match resolver.resolve(cache, &query).await {
            Ok(Some(Resolution {
                source,
                coordinates,
            })) => {
                record.coordinates = Some(coordinates);
                match source {
                    ResolutionSource::Cache => stats.cache_hits += 1,
                    ResolutionSource::Network => stats.network_resolutions += 1,
                }
                info!(site = %record.site_code, %query, ?source, "resolved");
            }
            Ok(None) => {
                stats.unresolved_base += 1;
                warn!(site = %record.site_code, %query, "address not found");
            }
            Err(err) => {
                stats.unresolved_base += 1;
                warn!(?err, site = %record.site_code, %query, "resolution failed");
            }
        }
    }
}
