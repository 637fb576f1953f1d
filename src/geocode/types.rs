//! Address and geocode data types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geocode::normalize::NormalizedAddress;

/// A point in provider coordinates (bd09ll), longitude first like the provider paths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lng: f64,
    pub lat: f64,
}

impl Coordinate {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Both components are finite and inside the WGS/BD latitude-longitude ranges.
    pub fn is_valid(&self) -> bool {
        self.lng.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lng)
            && (-90.0..=90.0).contains(&self.lat)
    }

    /// Provider query form: `lat,lng`.
    pub fn to_query(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lng)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lng, self.lat)
    }
}

/// Raw input row handed over by the import layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Free-text address.
    pub address: String,
    /// External identifier (e.g. the outlet name from the spreadsheet).
    #[serde(default)]
    pub id: Option<String>,
    /// Expected time spent at the stop.
    #[serde(default)]
    pub service_time_secs: Option<u32>,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: Option<u8>,
}

impl AddressRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: None,
            service_time_secs: None,
            priority: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Identifier if present, otherwise the address text.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.address)
    }
}

/// How precisely the provider located an address, coarsest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// House number / point of interest.
    Exact,
    Street,
    District,
    City,
    Approximate,
}

impl Precision {
    /// Map the provider's `level` string and `precise` flag to a tier.
    pub fn from_provider(level: Option<&str>, precise: bool) -> Self {
        if precise {
            return Precision::Exact;
        }
        match level.unwrap_or_default() {
            "门址" | "门牌号" | "兴趣点" | "NoClass" => Precision::Exact,
            "道路" | "道路交叉点" | "村庄" | "乡镇" | "商务大厦" | "教育" | "医疗"
            | "购物" | "酒店" | "公司企业" | "政府机构" => Precision::Street,
            "区县" | "开发区" | "商圈" => Precision::District,
            "城市" | "省" | "国家" => Precision::City,
            _ => Precision::Approximate,
        }
    }
}

/// Where a geocode came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Api,
    Browser,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Cache => "cache",
            ResolutionSource::Api => "api",
            ResolutionSource::Browser => "browser",
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub location: Coordinate,
    pub formatted_address: String,
    /// Provider confidence, 0-100.
    pub confidence: u8,
    pub precision: Precision,
    pub source: ResolutionSource,
    /// Seconds since the unix epoch.
    pub resolved_at: u64,
}

impl GeocodeResult {
    /// Same geocode relabelled as served from the cache.
    pub fn into_cached(mut self) -> Self {
        self.source = ResolutionSource::Cache;
        self
    }

    /// Geocodes are compared without their source label.
    pub fn same_value(&self, other: &GeocodeResult) -> bool {
        self.location == other.location
            && self.formatted_address == other.formatted_address
            && self.confidence == other.confidence
            && self.precision == other.precision
            && self.resolved_at == other.resolved_at
    }
}

/// A record paired with its geocode; the unit the optimizer works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStop {
    /// Position of the record in the input batch.
    pub index: usize,
    pub record: AddressRecord,
    pub key: NormalizedAddress,
    pub geocode: GeocodeResult,
}

impl ResolvedStop {
    pub fn location(&self) -> Coordinate {
        self.geocode.location
    }

    pub fn label(&self) -> &str {
        self.record.label()
    }
}

/// Driving metrics between two points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub distance_m: u64,
    pub duration_s: u64,
    /// Path points in travel order, may be empty.
    #[serde(default)]
    pub polyline: Vec<Coordinate>,
}
