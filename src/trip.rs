//! Trip snapshots and trip file discovery.
//!
//! Trip, accommodation and transport records are owned by the wider travel
//! application; the checklist only reads snapshots of them. Each trip is stored as
//! an individual JSON file under `<data_dir>/trips/` with the naming convention
//! `<trip_name>_trip.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A trip destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub city: String,
    pub country: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub arrival: Option<NaiveDate>,
    #[serde(default)]
    pub departure: Option<NaiveDate>,
    /// Destination carries a health advisory (vaccinations, malaria prophylaxis).
    #[serde(default)]
    pub health_advisory: bool,
}

/// Core trip record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub home_country: Option<String>,
    #[serde(default)]
    pub home_currency: Option<String>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl Trip {
    /// Whether `dest` lies outside the traveller's home country.
    ///
    /// Without a known home country nothing is considered international.
    pub fn is_international(&self, dest: &Destination) -> bool {
        match self.home_country.as_deref() {
            Some(home) => !same_place(home, &dest.country),
            None => false,
        }
    }

    pub fn international_destinations(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter().filter(|d| self.is_international(d))
    }

    pub fn has_international_leg(&self) -> bool {
        self.international_destinations().next().is_some()
    }
}

/// Accommodation booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accommodation {
    pub name: String,
    pub city: String,
    #[serde(default)]
    pub check_in: Option<NaiveDate>,
    #[serde(default)]
    pub check_out: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    Flight,
    Train,
    Bus,
    Car,
    Ferry,
    #[serde(other)]
    Other,
}

/// Transport booking between two cities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
    pub mode: TransportMode,
    #[serde(default)]
    pub from_city: Option<String>,
    pub to_city: String,
    #[serde(default)]
    pub departure_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Everything the checklist knows about one trip at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSnapshot {
    pub trip: Trip,
    #[serde(default)]
    pub accommodations: Vec<Accommodation>,
    #[serde(default)]
    pub transports: Vec<Transport>,
}

impl TripSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Case- and whitespace-insensitive comparison of place names.
pub fn same_place(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// A trip snapshot file found in the data directory.
#[derive(Debug, Clone)]
pub struct TripFile {
    pub name: String,
    pub display_name: String,
    pub file_path: PathBuf,
}

impl TripFile {
    /// Recognise a trip file by its `_trip.json` suffix.
    pub fn from_file(file_path: PathBuf) -> Option<Self> {
        let file_name = file_path.file_stem()?.to_str()?;
        let name = file_name.strip_suffix("_trip")?;
        let display_name = name.replace('_', " ");

        Some(TripFile {
            name: name.to_string(),
            display_name,
            file_path,
        })
    }

    pub fn load(&self) -> Result<TripSnapshot> {
        TripSnapshot::load(&self.file_path)
    }
}

/// Convert a display name to a safe file-name stem.
pub fn sanitize_trip_name(display_name: &str) -> String {
    display_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Discover all trip files, sorted by display name.
pub fn discover_trips(trips_dir: &Path) -> Result<Vec<TripFile>> {
    let mut trips = Vec::new();

    if !trips_dir.exists() {
        return Ok(trips);
    }

    for entry in fs::read_dir(trips_dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(trip) = TripFile::from_file(path) {
                trips.push(trip);
            }
        }
    }

    trips.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    Ok(trips)
}

/// Resolve a trip by file name, display name, or trip id.
pub fn resolve_trip(identifier: &str, trips_dir: &Path) -> Result<TripSnapshot> {
    let wanted = sanitize_trip_name(identifier);
    let files = discover_trips(trips_dir)?;

    if let Some(file) = files.iter().find(|f| f.name == wanted) {
        return file.load();
    }
    for file in &files {
        match file.load() {
            Ok(snapshot) if snapshot.trip.id == identifier => return Ok(snapshot),
            Ok(_) => {}
            Err(e) => tracing::warn!(path = %file.file_path.display(), error = %e, "Skipping unreadable trip file"),
        }
    }
    Err(Error::NotFound(format!("trip '{}'", identifier)))
}

/// Find the most recently modified trip file.
pub fn most_recent_trip(trips_dir: &Path) -> Result<Option<TripFile>> {
    let mut most_recent: Option<(TripFile, std::time::SystemTime)> = None;

    for trip in discover_trips(trips_dir)? {
        let Ok(modified) = fs::metadata(&trip.file_path).and_then(|m| m.modified()) else {
            continue;
        };
        match most_recent {
            Some((_, current)) if current >= modified => {}
            _ => most_recent = Some((trip, modified)),
        }
    }

    Ok(most_recent.map(|(trip, _)| trip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(city: &str, country: &str) -> Destination {
        Destination {
            city: city.into(),
            country: country.into(),
            currency: None,
            arrival: None,
            departure: None,
            health_advisory: false,
        }
    }

    #[test]
    fn test_sanitize_trip_name() {
        assert_eq!(sanitize_trip_name("Japan Spring 2025"), "japan_spring_2025");
        assert_eq!(sanitize_trip_name("Rome-Weekend!"), "rome_weekend");
        assert_eq!(sanitize_trip_name("  Multiple   Spaces  "), "multiple_spaces");
        assert_eq!(sanitize_trip_name(""), "");
    }

    #[test]
    fn test_international_requires_home_country() {
        let mut trip = Trip {
            id: "t1".into(),
            name: "Tour".into(),
            start_date: None,
            end_date: None,
            home_country: None,
            home_currency: None,
            destinations: vec![dest("Lyon", "France"), dest("Tokyo", "Japan")],
        };
        assert!(!trip.has_international_leg());

        trip.home_country = Some(" france ".into());
        let intl: Vec<_> = trip.international_destinations().map(|d| d.city.as_str()).collect();
        assert_eq!(intl, vec!["Tokyo"]);
    }

    #[test]
    fn test_discover_and_resolve_trip_files() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = TripSnapshot {
            trip: Trip {
                id: "trip-42".into(),
                name: "Lisbon".into(),
                start_date: None,
                end_date: None,
                home_country: None,
                home_currency: None,
                destinations: vec![],
            },
            accommodations: vec![],
            transports: vec![],
        };
        fs::write(dir.path().join("lisbon_break_trip.json"), serde_json::to_string(&snapshot).unwrap()).unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let found = discover_trips(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].display_name, "lisbon break");

        assert_eq!(resolve_trip("Lisbon Break", dir.path()).unwrap().trip.id, "trip-42");
        assert_eq!(resolve_trip("trip-42", dir.path()).unwrap().trip.name, "Lisbon");
        assert!(matches!(resolve_trip("nowhere", dir.path()), Err(Error::NotFound(_))));
    }
}
