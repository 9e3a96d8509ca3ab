use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::errors::AppResult;
use crate::geocode::Coordinates;

const CACHE_HEADER: [&str; 3] = ["adresse", "latitude", "longitude"];

/// Persistent mapping from a normalized query string to coordinates, backed
/// by a flat CSV file.
///
/// Keys are plain strings with no fuzzy matching: two textually different
/// queries for the same physical address are distinct entries. Entries are
/// never evicted within a run. Every novel `store` is appended to the file
/// immediately so an interrupted run keeps everything already resolved;
/// `persist` rewrites the whole file atomically at the end of the run.
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, Coordinates>,
    journal: csv::Writer<File>,
}

impl GeocodeCache {
    /// Loads the cache file, or starts empty when it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();

        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize::<(String, f64, f64)>() {
                let (key, lat, lon) = row?;
                entries.insert(key, Coordinates { lat, lon });
            }
            debug!(entries = entries.len(), path = %path.display(), "loaded geocode cache");
        }

        let journal = Self::open_journal(&path)?;
        Ok(Self {
            path,
            entries,
            journal,
        })
    }

    pub fn lookup(&self, key: &str) -> Option<Coordinates> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a resolution. Novel keys are appended to the cache file right
    /// away; a key already present is left untouched.
    pub fn store(&mut self, key: &str, coordinates: Coordinates) -> AppResult<()> {
        if self.entries.contains_key(key) {
            return Ok(());
        }
        self.entries.insert(key.to_string(), coordinates);
        self.journal.write_record([
            key,
            &coordinates.lat.to_string(),
            &coordinates.lon.to_string(),
        ])?;
        self.journal.flush()?;
        trace!(key, "cache entry appended");
        Ok(())
    }

    /// Rewrites the full cache file (temp file + rename) and reopens the
    /// append journal on the fresh file.
    pub fn persist(&mut self) -> AppResult<()> {
        let tmp_path = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path)?;
            writer.write_record(CACHE_HEADER)?;
            for (key, coordinates) in &self.entries {
                writer.write_record([
                    key.as_str(),
                    &coordinates.lat.to_string(),
                    &coordinates.lon.to_string(),
                ])?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.journal = Self::open_journal(&self.path)?;
        debug!(entries = self.entries.len(), path = %self.path.display(), "cache persisted");
        Ok(())
    }

    fn open_journal(path: &Path) -> AppResult<csv::Writer<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut journal = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            journal.write_record(CACHE_HEADER)?;
            journal.flush()?;
        }
        Ok(journal)
    }
}
