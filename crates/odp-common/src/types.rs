//! Core domain types for the import pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::OdpError;

/// One fetched snapshot of an upstream feed
///
/// Created when the connector detects new upstream data; immutable after
/// that. Identified by the feed name plus the remote last-modified
/// timestamp, so re-fetching the same upstream state yields the same
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetVersion {
    /// Upstream feed name, e.g. "gtfs"
    pub dataset: String,
    /// Remote last-modified timestamp of the snapshot archive
    pub last_modified: DateTime<Utc>,
}

impl DatasetVersion {
    pub fn new(dataset: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            dataset: dataset.into(),
            last_modified,
        }
    }

    /// Stable identifier used as the `version` column in the catalog
    pub fn id(&self) -> String {
        format!(
            "{}@{}",
            self.dataset,
            self.last_modified.format("%Y%m%dT%H%M%SZ")
        )
    }
}

impl std::fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Static registry of whitelisted tables in a transit snapshot
///
/// Table dispatch is resolved against this enum instead of a runtime
/// name-to-model lookup, so an unknown table is a typed error at the
/// pipeline edge rather than a failure deep inside a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Agency,
    Stops,
    Routes,
    Trips,
    StopTimes,
    Calendar,
    CalendarDates,
    Transfers,
}

impl TableKind {
    /// Every whitelisted table, in load order
    pub const ALL: [TableKind; 8] = [
        TableKind::Agency,
        TableKind::Stops,
        TableKind::Routes,
        TableKind::Trips,
        TableKind::StopTimes,
        TableKind::Calendar,
        TableKind::CalendarDates,
        TableKind::Transfers,
    ];

    /// Production table name
    pub fn table_name(&self) -> &'static str {
        match self {
            TableKind::Agency => "agency",
            TableKind::Stops => "stops",
            TableKind::Routes => "routes",
            TableKind::Trips => "trips",
            TableKind::StopTimes => "stop_times",
            TableKind::Calendar => "calendar",
            TableKind::CalendarDates => "calendar_dates",
            TableKind::Transfers => "transfers",
        }
    }

    /// Staging table name: write-only until promotion
    pub fn staging_name(&self) -> String {
        format!("tmp_{}", self.table_name())
    }

    /// Transient rename target used while promoting
    pub fn retired_name(&self) -> String {
        format!("old_{}", self.table_name())
    }

    /// Column set for this table
    ///
    /// Parsed rows are aligned to these columns by header name; extra
    /// upstream columns are dropped, missing ones load as empty strings.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Agency => &[
                "agency_id",
                "agency_name",
                "agency_url",
                "agency_timezone",
                "agency_lang",
                "agency_phone",
            ],
            TableKind::Stops => &[
                "stop_id",
                "stop_code",
                "stop_name",
                "stop_desc",
                "stop_lat",
                "stop_lon",
                "zone_id",
                "location_type",
                "parent_station",
                "wheelchair_boarding",
            ],
            TableKind::Routes => &[
                "route_id",
                "agency_id",
                "route_short_name",
                "route_long_name",
                "route_desc",
                "route_type",
                "route_color",
                "route_text_color",
            ],
            TableKind::Trips => &[
                "route_id",
                "service_id",
                "trip_id",
                "trip_headsign",
                "direction_id",
                "block_id",
                "shape_id",
                "wheelchair_accessible",
            ],
            TableKind::StopTimes => &[
                "trip_id",
                "arrival_time",
                "departure_time",
                "stop_id",
                "stop_sequence",
                "stop_headsign",
                "pickup_type",
                "drop_off_type",
            ],
            TableKind::Calendar => &[
                "service_id",
                "monday",
                "tuesday",
                "wednesday",
                "thursday",
                "friday",
                "saturday",
                "sunday",
                "start_date",
                "end_date",
            ],
            TableKind::CalendarDates => &["service_id", "date", "exception_type"],
            TableKind::Transfers => &[
                "from_stop_id",
                "to_stop_id",
                "transfer_type",
                "min_transfer_time",
            ],
        }
    }

    /// Resolve a file inside the snapshot archive to a whitelisted table
    ///
    /// Returns `None` for files outside the whitelist; those are skipped
    /// during decompression, not treated as errors.
    pub fn from_file_name(name: &str) -> Option<TableKind> {
        let stem = name.strip_suffix(".txt").unwrap_or(name);
        TableKind::ALL
            .into_iter()
            .find(|t| t.table_name() == stem)
    }
}

impl std::str::FromStr for TableKind {
    type Err = OdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableKind::ALL
            .into_iter()
            .find(|t| t.table_name() == s)
            .ok_or_else(|| OdpError::UnknownTable(s.to_string()))
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// One raw file yielded by the connector for a whitelisted table
///
/// Consumed exactly once by the transform stage and then discarded; the
/// underlying file may be cleaned up by the runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFileDescriptor {
    /// Table this file holds rows for
    pub table: TableKind,
    /// Local path of the decompressed file
    pub path: PathBuf,
    /// Modification timestamp carried from the snapshot
    pub mtime: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_id_is_stable() {
        let stamp = Utc.with_ymd_and_hms(2026, 3, 14, 6, 30, 0).unwrap();
        let v = DatasetVersion::new("gtfs", stamp);
        assert_eq!(v.id(), "gtfs@20260314T063000Z");
        assert_eq!(v.id(), DatasetVersion::new("gtfs", stamp).id());
    }

    #[test]
    fn test_table_kind_from_file_name() {
        assert_eq!(TableKind::from_file_name("stops.txt"), Some(TableKind::Stops));
        assert_eq!(
            TableKind::from_file_name("stop_times.txt"),
            Some(TableKind::StopTimes)
        );
        assert_eq!(TableKind::from_file_name("shapes.txt"), None);
        assert_eq!(TableKind::from_file_name("fare_rules.txt"), None);
    }

    #[test]
    fn test_staging_and_retired_names() {
        assert_eq!(TableKind::Routes.staging_name(), "tmp_routes");
        assert_eq!(TableKind::Routes.retired_name(), "old_routes");
    }

    #[test]
    fn test_table_kind_round_trips_serde() {
        let json = serde_json::to_string(&TableKind::CalendarDates).unwrap();
        assert_eq!(json, "\"calendar_dates\"");
        let back: TableKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TableKind::CalendarDates);
    }

    #[test]
    fn test_columns_are_nonempty_for_all_tables() {
        for table in TableKind::ALL {
            assert!(!table.columns().is_empty(), "{table} has no columns");
        }
    }
}
