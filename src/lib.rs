pub mod cache;
pub mod config;
pub mod errors;
pub mod geocode;
pub mod ingestion;
pub mod map;
pub mod pipeline;
pub mod refine;
pub mod telemetry;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::GeocodeCache;
pub use config::AppConfig;
pub use errors::{AppError, AppResult};
pub use geocode::{Coordinates, GeocodeLookup, GeocoderService, Resolver};
pub use ingestion::{AddressRecord, AddressTable, PostalDirectory};
pub use pipeline::{RunPaths, RunStats};
pub use refine::BoundingRegion;
pub use telemetry::TelemetryClient;

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,insee_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
