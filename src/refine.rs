use serde::Serialize;
use tracing::{info, warn};

use crate::cache::GeocodeCache;
use crate::errors::AppResult;
use crate::geocode::{Coordinates, Resolver};
use crate::ingestion::AddressTable;

/// Rectangular latitude/longitude envelope defining plausible coordinates
/// for the dataset. Fixed for the whole run; used only as a predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingRegion {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingRegion {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    pub fn contains(&self, coordinates: Coordinates) -> bool {
        (self.min_lat..=self.max_lat).contains(&coordinates.lat)
            && (self.min_lon..=self.max_lon).contains(&coordinates.lon)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RefineStats {
    pub examined: usize,
    pub corrected: usize,
    pub unresolved: usize,
}

/// Second pass over the table: every record whose coordinates are missing
/// or fall outside the region is retried with alternative query
/// formulations. A cached candidate that fails the predicate moves on
/// without touching the network; network answers are cached regardless of
/// the predicate so later candidates (and later runs) can reuse them.
pub async fn refine_out_of_region(
    table: &mut AddressTable,
    cache: &mut GeocodeCache,
    resolver: &Resolver,
    region: &BoundingRegion,
    country: &str,
) -> AppResult<RefineStats> {
    let mut stats = RefineStats::default();

    for record in &mut table.records {
        if record
            .coordinates
            .map(|c| region.contains(c))
            .unwrap_or(false)
        {
            continue;
        }
        stats.examined += 1;

        let mut accepted = None;
        for candidate in record.fallback_queries(country) {
            if let Some(cached) = cache.lookup(&candidate) {
                if region.contains(cached) {
                    info!(site = %record.site_code, query = %candidate, "refined from cache");
                    accepted = Some(cached);
                    break;
                }
                continue;
            }

            match resolver.resolve_via_network(cache, &candidate).await {
                Ok(Some(coordinates)) if region.contains(coordinates) => {
                    info!(site = %record.site_code, query = %candidate, "refined via lookup");
                    accepted = Some(coordinates);
                    break;
                }
                Ok(_) => {
                    info!(site = %record.site_code, query = %candidate, "candidate outside region or unknown");
                }
                Err(err) => {
                    warn!(?err, site = %record.site_code, query = %candidate, "candidate lookup failed");
                }
            }
        }

        match accepted {
            Some(coordinates) => {
                record.coordinates = Some(coordinates);
                stats.corrected += 1;
            }
            None => {
                // Terminal soft failure for this record.
                record.coordinates = None;
                stats.unresolved += 1;
                warn!(site = %record.site_code, "no candidate inside region");
            }
        }
    }

    Ok(stats)
}
