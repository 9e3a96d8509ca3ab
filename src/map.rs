use std::fs;
use std::path::Path;

use serde_json::json;
use tracing::debug;

use crate::errors::AppResult;
use crate::ingestion::AddressTable;

// Metropolitan France, used when nothing resolved at all.
const FALLBACK_CENTER: (f64, f64) = (46.6, 1.9);
const DEFAULT_ZOOM: u8 = 6;

/// Writes a standalone Leaflet map with one marker per resolved record.
/// Records without coordinates are silently omitted. Returns the number of
/// markers plotted.
pub fn render_map(table: &AddressTable, path: impl AsRef<Path>) -> AppResult<usize> {
    let markers: Vec<serde_json::Value> = table
        .records
        .iter()
        .filter_map(|record| {
            record.coordinates.map(|c| {
                json!({
                    "lat": c.lat,
                    "lon": c.lon,
                    "label": format!("{} - {}", record.site_code, record.address),
                })
            })
        })
        .collect();

    let center = if markers.is_empty() {
        FALLBACK_CENTER
    } else {
        let count = markers.len() as f64;
        let (lat_sum, lon_sum) = table
            .records
            .iter()
            .filter_map(|record| record.coordinates)
            .fold((0.0, 0.0), |(lat, lon), c| (lat + c.lat, lon + c.lon));
        (lat_sum / count, lon_sum / count)
    };

    let html = render_html(&markers, center)?;
    fs::write(path.as_ref(), html)?;
    debug!(markers = markers.len(), path = %path.as_ref().display(), "map written");
    Ok(markers.len())
}

fn render_html(markers: &[serde_json::Value], center: (f64, f64)) -> AppResult<String> {
    let markers_json = serde_json::to_string(markers)?;
    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Geocoded sites</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>html, body, #map {{ height: 100%; margin: 0; }}</style>
</head>
<body>
<div id="map"></div>
<script>
const markers = {markers_json};
const map = L.map("map").setView([{lat}, {lon}], {zoom});
L.tileLayer("https://tile.openstreetmap.org/{{z}}/{{x}}/{{y}}.png", {{
  attribution: "&copy; OpenStreetMap contributors"
}}).addTo(map);
for (const m of markers) {{
  L.marker([m.lat, m.lon]).bindPopup(m.label).addTo(map);
}}
</script>
</body>
</html>
"#,
        lat = center.0,
        lon = center.1,
        zoom = DEFAULT_ZOOM,
    ))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::geocode::Coordinates;
    use crate::ingestion::AddressRecord;

    use super::*;

    fn record(site: &str, address: &str, coordinates: Option<Coordinates>) -> AddressRecord {
        AddressRecord {
            site_code: site.into(),
            address: address.into(),
            insee_code: "86194".into(),
            commune: "Poitiers".into(),
            postal_code: Some("86000".into()),
            coordinates,
            extras: Vec::new(),
        }
    }

    #[test]
    fn plots_only_resolved_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.html");
        let table = AddressTable::from_records(vec![
            record("U01", "1 Rue de la Paix", Some(Coordinates { lat: 46.58, lon: 0.34 })),
            record("U02", "2 Grand Rue", None),
        ]);

        let plotted = render_map(&table, &path).unwrap();

        assert_eq!(plotted, 1);
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("U01 - 1 Rue de la Paix"));
        assert!(!html.contains("U02"));
    }

    #[test]
    fn empty_table_still_renders_an_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.html");
        let table = AddressTable::from_records(vec![record("U02", "2 Grand Rue", None)]);

        let plotted = render_map(&table, &path).unwrap();

        assert_eq!(plotted, 0);
        assert!(path.exists());
    }
}
