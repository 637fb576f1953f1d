//! Geocode caching and persistence.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::geocode::{Coordinate, GeocodeResult, NormalizedAddress, Precision, ResolutionSource};
use crate::observability::metrics;

const FORMAT_VERSION: u32 = 1;

/// On-disk form of one entry. Unknown fields are ignored on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    lng: f64,
    lat: f64,
    #[serde(default)]
    formatted_address: String,
    #[serde(default)]
    confidence: u8,
    #[serde(default = "default_precision")]
    precision: Precision,
    #[serde(default = "default_source")]
    source: ResolutionSource,
    resolved_at: u64,
}

fn default_precision() -> Precision {
    Precision::Approximate
}

fn default_source() -> ResolutionSource {
    ResolutionSource::Api
}

impl From<&GeocodeResult> for StoredEntry {
    fn from(r: &GeocodeResult) -> Self {
        Self {
            lng: r.location.lng,
            lat: r.location.lat,
            formatted_address: r.formatted_address.clone(),
            confidence: r.confidence,
            precision: r.precision,
            source: r.source,
            resolved_at: r.resolved_at,
        }
    }
}

impl From<StoredEntry> for GeocodeResult {
    fn from(e: StoredEntry) -> Self {
        Self {
            location: Coordinate::new(e.lng, e.lat),
            formatted_address: e.formatted_address,
            confidence: e.confidence,
            precision: e.precision,
            source: e.source,
            resolved_at: e.resolved_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, StoredEntry>,
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Within max age; returned with `source = cache`.
    Fresh(GeocodeResult),
    /// Older than max age. Kept as a last resort.
    Stale(GeocodeResult),
    Miss,
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
    /// Same value, or an older/less confident result for a fresh entry.
    Unchanged,
}

/// Fresh and stale entry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub fresh: usize,
    pub stale: usize,
}

/// Thread-safe address → geocode cache with JSON persistence.
#[derive(Clone)]
pub struct AddressCache {
    inner: Arc<DashMap<NormalizedAddress, GeocodeResult>>,
    persistence_path: Option<PathBuf>,
    max_age_secs: u64,
    clock: Arc<dyn Clock>,
    dirty: Arc<AtomicBool>,
}

impl AddressCache {
    /// Create a new empty cache.
    pub fn new(persistence_path: Option<PathBuf>, max_age_secs: u64) -> Self {
        Self::with_clock(persistence_path, max_age_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(persistence_path: Option<PathBuf>, max_age_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            persistence_path,
            max_age_secs,
            clock,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// In-memory cache that is never persisted.
    pub fn in_memory(max_age_secs: u64) -> Self {
        Self::new(None, max_age_secs)
    }

    /// Open a cache backed by `path`, loading it if the file exists.
    pub fn open(path: impl AsRef<Path>, max_age_secs: u64) -> std::io::Result<Self> {
        Self::open_with_clock(path, max_age_secs, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        max_age_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let path = path.as_ref();
        let cache = Self::with_clock(Some(path.to_path_buf()), max_age_secs, clock);
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let file: CacheFile = serde_json::from_reader(reader)?;
            if file.version > FORMAT_VERSION {
                tracing::warn!(
                    version = file.version,
                    supported = FORMAT_VERSION,
                    "Cache file written by a newer version, reading known fields only"
                );
            }
            for (key, entry) in file.entries {
                cache.inner.insert(crate::geocode::normalize(&key), entry.into());
            }
            tracing::info!(entries = cache.inner.len(), path = %path.display(), "Loaded geocode cache");
        }
        Ok(cache)
    }

    fn is_fresh(&self, result: &GeocodeResult, now: u64) -> bool {
        now.saturating_sub(result.resolved_at) <= self.max_age_secs
    }

    /// Fresh entry for `key`. Never touches the network.
    pub fn get(&self, key: &NormalizedAddress) -> Option<GeocodeResult> {
        match self.lookup(key) {
            CacheLookup::Fresh(result) => Some(result),
            _ => None,
        }
    }

    /// Fresh, stale or missing. Stale entries are reported, never removed.
    pub fn lookup(&self, key: &NormalizedAddress) -> CacheLookup {
        let now = self.clock.now_unix();
        let lookup = match self.inner.get(key) {
            Some(r) if self.is_fresh(r.value(), now) => CacheLookup::Fresh(r.value().clone().into_cached()),
            Some(r) => CacheLookup::Stale(r.value().clone().into_cached()),
            None => CacheLookup::Miss,
        };
        metrics::record_cache_lookup(match lookup {
            CacheLookup::Fresh(_) => "hit",
            CacheLookup::Stale(_) => "stale",
            CacheLookup::Miss => "miss",
        });
        lookup
    }

    /// Store a resolution.
    ///
    /// Replaces an existing entry when it is stale, or when the new result is
    /// at least as recent and at least as confident. Equal values are a no-op.
    pub fn put(&self, key: NormalizedAddress, result: GeocodeResult) -> PutOutcome {
        let now = self.clock.now_unix();
        let outcome = match self.inner.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(result);
                PutOutcome::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.same_value(&result) {
                    PutOutcome::Unchanged
                } else if !self.is_fresh(existing, now)
                    || (result.resolved_at >= existing.resolved_at
                        && result.confidence >= existing.confidence)
                {
                    slot.insert(result);
                    PutOutcome::Replaced
                } else {
                    PutOutcome::Unchanged
                }
            }
        };
        if outcome != PutOutcome::Unchanged {
            self.dirty.store(true, Ordering::Release);
        }
        outcome
    }

    /// Persist if anything changed since the last flush.
    ///
    /// Writes a sibling temp file and renames it over the target, so readers
    /// never see a partial file.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let entries: BTreeMap<String, StoredEntry> = self
            .inner
            .iter()
            .map(|r| (r.key().as_str().to_string(), StoredEntry::from(r.value())))
            .collect();
        let file = CacheFile {
            version: FORMAT_VERSION,
            entries,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let result = (|| {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            drop(writer);
            fs::rename(&tmp, path)
        })();

        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        tracing::info!(entries = file.entries.len(), path = %path.display(), "Saved geocode cache");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs
    }

    /// View of the same entries with a different staleness boundary.
    pub fn with_max_age(&self, max_age_secs: u64) -> Self {
        Self {
            max_age_secs,
            ..self.clone()
        }
    }

    /// Get a summary of fresh/stale entries.
    pub fn summary(&self) -> CacheSummary {
        let now = self.clock.now_unix();
        let mut summary = CacheSummary { fresh: 0, stale: 0 };
        for r in self.inner.iter() {
            if self.is_fresh(r.value(), now) {
                summary.fresh += 1;
            } else {
                summary.stale += 1;
            }
        }
        summary
    }
}

impl std::fmt::Debug for AddressCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCache")
            .field("entries", &self.inner.len())
            .field("path", &self.persistence_path)
            .field("max_age_secs", &self.max_age_secs)
            .finish()
    }
}
