//! GeoIP enrichment
//!
//! Pure in-memory IPv4 range lookup. The range table is loaded once at
//! startup from a CSV file (`start_ip,end_ip,country,city,lat,lon,isp`,
//! addresses in dotted-quad form, one range per line, `#` comments allowed).
//! Misses and IPv6 peers yield all-null fields; nothing downstream treats
//! that as an error.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Geo attributes attached to a session. All fields nullable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoInfo {
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

#[derive(Debug, Clone)]
struct GeoRange {
    start: u32,
    end: u32,
    info: GeoInfo,
}

#[derive(Debug, Error)]
pub enum GeoIpError {
    #[error("failed to read geoip database {path}: {message}")]
    Read { path: String, message: String },
    #[error("bad geoip row at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Range-table resolver. Lookup is a binary search over sorted,
/// non-overlapping ranges.
pub struct GeoIpResolver {
    ranges: Vec<GeoRange>,
}

impl GeoIpResolver {
    /// A resolver with no ranges; every lookup misses.
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Load a CSV range database from disk.
    pub fn from_csv_path(path: &Path) -> Result<Self, GeoIpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| GeoIpError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let resolver = Self::from_csv(&raw)?;
        info!(
            target: "server",
            ranges = resolver.ranges.len(),
            path = %path.display(),
            "geoip database loaded"
        );
        Ok(resolver)
    }

    /// Parse CSV content into a resolver.
    pub fn from_csv(raw: &str) -> Result<Self, GeoIpError> {
        let mut ranges = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 7 {
                return Err(GeoIpError::Parse {
                    line: idx + 1,
                    message: format!("expected 7 fields, got {}", fields.len()),
                });
            }
            let start = parse_v4(fields[0], idx + 1)?;
            let end = parse_v4(fields[1], idx + 1)?;
            if end < start {
                return Err(GeoIpError::Parse {
                    line: idx + 1,
                    message: "range end before start".to_string(),
                });
            }
            ranges.push(GeoRange {
                start,
                end,
                info: GeoInfo {
                    country_code: opt(fields[2]),
                    city: opt(fields[3]),
                    latitude: fields[4].parse().ok(),
                    longitude: fields[5].parse().ok(),
                    isp: opt(fields[6]),
                },
            });
        }
        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }

    /// Look up an address. Misses return an all-null `GeoInfo`.
    pub fn lookup(&self, ip: IpAddr) -> GeoInfo {
        let IpAddr::V4(v4) = ip else {
            return GeoInfo::default();
        };
        let needle = u32::from(v4);
        let idx = self.ranges.partition_point(|r| r.start <= needle);
        if idx == 0 {
            return GeoInfo::default();
        }
        let candidate = &self.ranges[idx - 1];
        if needle <= candidate.end {
            candidate.info.clone()
        } else {
            GeoInfo::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_v4(s: &str, line: usize) -> Result<u32, GeoIpError> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| GeoIpError::Parse {
            line,
            message: format!("bad IPv4 address: {s}"),
        })
}

fn opt(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
