use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::geocode::Coordinates;

// Header names are part of the input contract. Matching is
// whitespace-trimmed: the source spreadsheets carry trailing blanks
// ("Adresse  ").
pub const COL_ADDRESS: &str = "Adresse";
pub const COL_INSEE: &str = "Code postal INSEE";
pub const COL_COMMUNE: &str = "Nom_de_la_commune";
pub const COL_SITE: &str = "code_usine";
pub const COL_POSTAL: &str = "Code_postal";
pub const COL_LAT: &str = "latitude";
pub const COL_LON: &str = "longitude";

pub const REF_COL_INSEE: &str = "#Code_commune_INSEE";
pub const REF_COL_POSTAL: &str = "Code_postal";

/// One row of the address table. Coordinates are filled in place by the
/// resolution passes; unknown input columns ride along untouched.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub site_code: String,
    pub address: String,
    pub insee_code: String,
    pub commune: String,
    pub postal_code: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub extras: Vec<String>,
}

impl AddressRecord {
    /// Base-pass query string: address + postal code + country. This exact
    /// string is also the cache key; construction lives here so the write
    /// and read paths can never drift apart.
    pub fn base_query(&self, country: &str) -> String {
        let postal = self.postal_code.as_deref().unwrap_or("");
        compose_query(&[&self.address, postal], country)
            .unwrap_or_else(|| format!(", {country}"))
    }

    /// Refinement candidates, most to least specific, empty components
    /// dropped and duplicates removed while preserving order.
    pub fn fallback_queries(&self, country: &str) -> Vec<String> {
        let postal = self.postal_code.as_deref().unwrap_or("");
        let candidates = [
            compose_query(&[&self.address, postal, &self.commune], country),
            compose_query(&[&self.address, postal], country),
            compose_query(&[postal, &self.commune], country),
        ];

        let mut queries = Vec::with_capacity(candidates.len());
        for candidate in candidates.into_iter().flatten() {
            if !queries.contains(&candidate) {
                queries.push(candidate);
            }
        }
        queries
    }
}

fn compose_query(parts: &[&str], country: &str) -> Option<String> {
    let joined = parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(format!("{joined}, {country}"))
    }
}

/// The address table with its passthrough columns.
#[derive(Debug)]
pub struct AddressTable {
    extra_headers: Vec<String>,
    pub records: Vec<AddressRecord>,
}

impl AddressTable {
    /// Builds a table with no passthrough columns.
    pub fn from_records(records: Vec<AddressRecord>) -> Self {
        Self {
            extra_headers: Vec::new(),
            records,
        }
    }

    /// Reads the address table. An unreadable or malformed file is fatal.
    pub fn from_csv(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| AppError::Input(path.display().to_string(), err))?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let required = |name: &str| {
            col(name).ok_or_else(|| {
                AppError::Parse(format!("{}: missing required column {name:?}", path.display()))
            })
        };

        let address_idx = required(COL_ADDRESS)?;
        let insee_idx = required(COL_INSEE)?;
        let commune_idx = required(COL_COMMUNE)?;
        let site_idx = required(COL_SITE)?;
        let postal_idx = col(COL_POSTAL);
        let lat_idx = col(COL_LAT);
        let lon_idx = col(COL_LON);

        let known = [
            Some(address_idx),
            Some(insee_idx),
            Some(commune_idx),
            Some(site_idx),
            postal_idx,
            lat_idx,
            lon_idx,
        ];
        let extra_indices: Vec<usize> = (0..headers.len())
            .filter(|idx| !known.contains(&Some(*idx)))
            .collect();
        let extra_headers = extra_indices
            .iter()
            .map(|&idx| headers[idx].clone())
            .collect();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let cell = |idx: usize| row.get(idx).unwrap_or("").to_string();
            let opt_cell = |idx: Option<usize>| {
                idx.map(|i| cell(i)).filter(|value| !value.is_empty())
            };

            let coordinates = match (
                opt_cell(lat_idx).and_then(|v| v.parse::<f64>().ok()),
                opt_cell(lon_idx).and_then(|v| v.parse::<f64>().ok()),
            ) {
                (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
                _ => None,
            };

            records.push(AddressRecord {
                site_code: cell(site_idx),
                address: cell(address_idx),
                insee_code: cell(insee_idx),
                commune: cell(commune_idx),
                postal_code: opt_cell(postal_idx),
                coordinates,
                extras: extra_indices.iter().map(|&idx| cell(idx)).collect(),
            });
        }

        debug!(rows = records.len(), path = %path.display(), "loaded address table");
        Ok(Self {
            extra_headers,
            records,
        })
    }

    /// Left join against the postal directory on the trimmed INSEE code.
    /// Postal codes already present (a resumed run) are kept.
    pub fn join_postal(&mut self, directory: &PostalDirectory) -> usize {
        let mut joined = 0;
        for record in &mut self.records {
            if record.postal_code.is_none() {
                record.postal_code = directory
                    .postal_for(record.insee_code.trim())
                    .map(str::to_string);
            }
            if record.postal_code.is_some() {
                joined += 1;
            }
        }
        joined
    }

    /// Writes the enriched table: contract columns first, passthrough
    /// columns, then `Code_postal`/`latitude`/`longitude` at the end (any
    /// input copies of those three are folded in rather than duplicated).
    pub fn write_csv(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;

        let mut headers = vec![COL_SITE, COL_ADDRESS, COL_INSEE, COL_COMMUNE];
        headers.extend(self.extra_headers.iter().map(String::as_str));
        headers.extend([COL_POSTAL, COL_LAT, COL_LON]);
        writer.write_record(&headers)?;

        for record in &self.records {
            let mut row = vec![
                record.site_code.clone(),
                record.address.clone(),
                record.insee_code.clone(),
                record.commune.clone(),
            ];
            row.extend(record.extras.iter().cloned());
            row.push(record.postal_code.clone().unwrap_or_default());
            match record.coordinates {
                Some(c) => {
                    row.push(c.lat.to_string());
                    row.push(c.lon.to_string());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// INSEE code to postal code lookup, deduplicated on the INSEE side so the
/// join stays one-to-one.
#[derive(Debug, Default)]
pub struct PostalDirectory {
    map: HashMap<String, String>,
}

impl PostalDirectory {
    /// Reads the `;`-delimited reference table. The upstream file is
    /// Latin-1 encoded, so cells are decoded lossily rather than rejected.
    pub fn from_csv(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| AppError::Input(path.display().to_string(), err))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .from_reader(file);

        let headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();
        let find = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                AppError::Parse(format!("{}: missing required column {name:?}", path.display()))
            })
        };
        let insee_idx = find(REF_COL_INSEE)?;
        let postal_idx = find(REF_COL_POSTAL)?;

        let mut map = HashMap::new();
        for row in reader.byte_records() {
            let row = row?;
            let cell = |idx: usize| {
                row.get(idx)
                    .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
                    .unwrap_or_default()
            };
            let insee = cell(insee_idx);
            if insee.is_empty() {
                continue;
            }
            // Keep-first dedup: one arbitrary but deterministic row per key.
            map.entry(insee).or_insert_with(|| cell(postal_idx));
        }

        debug!(entries = map.len(), path = %path.display(), "loaded postal directory");
        Ok(Self { map })
    }

    pub fn postal_for(&self, insee: &str) -> Option<&str> {
        self.map.get(insee).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn loads_table_with_padded_headers_and_extras() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "usines.csv",
            b"code_usine,Adresse  ,Code postal INSEE,Nom_de_la_commune,effectif\n\
              U01,1 Rue de la Paix, 86194 ,Poitiers,12\n",
        );

        let table = AddressTable::from_csv(&path).unwrap();
        assert_eq!(table.len(), 1);
        let record = &table.records[0];
        assert_eq!(record.site_code, "U01");
        assert_eq!(record.address, "1 Rue de la Paix");
        assert_eq!(record.insee_code, "86194");
        assert_eq!(record.commune, "Poitiers");
        assert_eq!(record.extras, vec!["12".to_string()]);
        assert!(record.coordinates.is_none());
    }

    #[test]
    fn prior_coordinates_are_loaded() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "resumed.csv",
            b"code_usine,Adresse,Code postal INSEE,Nom_de_la_commune,Code_postal,latitude,longitude\n\
              U01,1 Rue de la Paix,86194,Poitiers,86000,46.58,0.34\n\
              U02,2 Grand Rue,86046,Chauvigny,86300,,\n",
        );

        let table = AddressTable::from_csv(&path).unwrap();
        assert_eq!(
            table.records[0].coordinates,
            Some(Coordinates { lat: 46.58, lon: 0.34 })
        );
        assert_eq!(table.records[0].postal_code.as_deref(), Some("86000"));
        assert!(table.records[1].coordinates.is_none());
    }

    #[test]
    fn missing_input_file_is_fatal() {
        let dir = tempdir().unwrap();
        let err = AddressTable::from_csv(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, AppError::Input(_, _)));
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "bad.csv", b"code_usine,Adresse\nU01,1 Rue Haute\n");
        let err = AddressTable::from_csv(&path).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn reference_dedup_keeps_one_postal_per_key() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "ref.csv",
            b"#Code_commune_INSEE;Nom_de_la_commune;Code_postal\n\
              86000;POITIERS;A\n\
              86000;POITIERS;B\n\
              86046;CHAUVIGNY;86300\n",
        );

        let directory = PostalDirectory::from_csv(&path).unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.postal_for("86000"), Some("A"));

        let table_path = write_file(
            &dir,
            "usines.csv",
            b"code_usine,Adresse,Code postal INSEE,Nom_de_la_commune\n\
              U01,1 Rue Basse, 86000 ,Poitiers\n",
        );
        let mut table = AddressTable::from_csv(&table_path).unwrap();
        let joined = table.join_postal(&directory);
        assert_eq!(joined, 1);
        assert_eq!(table.records[0].postal_code.as_deref(), Some("A"));
    }

    #[test]
    fn join_misses_leave_postal_empty() {
        let dir = tempdir().unwrap();
        let ref_path = write_file(
            &dir,
            "ref.csv",
            b"#Code_commune_INSEE;Code_postal\n86194;86000\n",
        );
        let table_path = write_file(
            &dir,
            "usines.csv",
            b"code_usine,Adresse,Code postal INSEE,Nom_de_la_commune\n\
              U01,1 Rue Basse,99999,Nulle Part\n",
        );

        let directory = PostalDirectory::from_csv(&ref_path).unwrap();
        let mut table = AddressTable::from_csv(&table_path).unwrap();
        assert_eq!(table.join_postal(&directory), 0);
        assert!(table.records[0].postal_code.is_none());
    }

    #[test]
    fn latin1_reference_cells_are_tolerated() {
        let dir = tempdir().unwrap();
        // "CHÂTELLERAULT" with a Latin-1 0xC2 byte in the commune column.
        let mut bytes = b"#Code_commune_INSEE;Nom_de_la_commune;Code_postal\n86066;CH".to_vec();
        bytes.push(0xC2);
        bytes.extend_from_slice(b"TELLERAULT;86100\n");
        let path = write_file(&dir, "ref_latin1.csv", &bytes);

        let directory = PostalDirectory::from_csv(&path).unwrap();
        assert_eq!(directory.postal_for("86066"), Some("86100"));
    }

    #[test]
    fn base_query_concatenates_address_postal_country() {
        let record = AddressRecord {
            site_code: "U01".into(),
            address: "1 Rue de la Paix".into(),
            insee_code: "86194".into(),
            commune: "Poitiers".into(),
            postal_code: Some("86000".into()),
            coordinates: None,
            extras: Vec::new(),
        };
        assert_eq!(record.base_query("France"), "1 Rue de la Paix 86000, France");
    }

    #[test]
    fn fallback_queries_are_ordered_most_to_least_specific() {
        let record = AddressRecord {
            site_code: "U01".into(),
            address: "1 Rue de la Paix".into(),
            insee_code: "86194".into(),
            commune: "Poitiers".into(),
            postal_code: Some("86000".into()),
            coordinates: None,
            extras: Vec::new(),
        };
        assert_eq!(
            record.fallback_queries("France"),
            vec![
                "1 Rue de la Paix 86000 Poitiers, France".to_string(),
                "1 Rue de la Paix 86000, France".to_string(),
                "86000 Poitiers, France".to_string(),
            ]
        );
    }

    #[test]
    fn fallback_queries_collapse_when_commune_missing() {
        let record = AddressRecord {
            site_code: "U01".into(),
            address: "1 Rue de la Paix".into(),
            insee_code: "86194".into(),
            commune: "".into(),
            postal_code: Some("86000".into()),
            coordinates: None,
            extras: Vec::new(),
        };
        assert_eq!(
            record.fallback_queries("France"),
            vec![
                "1 Rue de la Paix 86000, France".to_string(),
                "86000, France".to_string(),
            ]
        );
    }

    #[test]
    fn enriched_table_round_trips_through_csv() {
        let dir = tempdir().unwrap();
        let path = write_file(
            &dir,
            "usines.csv",
            b"code_usine,Adresse,Code postal INSEE,Nom_de_la_commune,effectif\n\
              U01,1 Rue de la Paix,86194,Poitiers,12\n",
        );
        let mut table = AddressTable::from_csv(&path).unwrap();
        table.records[0].postal_code = Some("86000".into());
        table.records[0].coordinates = Some(Coordinates { lat: 46.58, lon: 0.34 });

        let out = dir.path().join("enriched.csv");
        table.write_csv(&out).unwrap();

        let reloaded = AddressTable::from_csv(&out).unwrap();
        assert_eq!(reloaded.records[0].postal_code.as_deref(), Some("86000"));
        assert_eq!(
            reloaded.records[0].coordinates,
            Some(Coordinates { lat: 46.58, lon: 0.34 })
        );
        assert_eq!(reloaded.records[0].extras, vec!["12".to_string()]);
    }
}
