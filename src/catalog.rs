use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{ProviderKind, Target, TargetId};
use crate::error::BackfillError;

pub const CATALOG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_CATALOG_PATH: &str = "targets.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetEntry {
    /// `[id, latitude, longitude, name]`
    Shorthand(String, f64, f64, String),
    Detailed(TargetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TargetEntryObject {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    #[serde(default)]
    pub station_ref: Option<String>,
}

/// Validated, read-only registry of collection targets.
#[derive(Debug, Clone)]
pub struct Catalog {
    targets: Vec<Target>,
    groups: Vec<String>,
}

impl Catalog {
    pub fn new(targets: Vec<Target>) -> Result<Self, BackfillError> {
        let mut seen = HashSet::new();
        let mut groups: Vec<String> = Vec::new();
        for target in &targets {
            validate_coordinates(target)?;
            if !seen.insert(target.id.clone()) {
                return Err(BackfillError::DuplicateTarget(target.id.to_string()));
            }
            if target.group.trim().is_empty() {
                return Err(BackfillError::EmptyGroupName);
            }
            if !groups.contains(&target.group) {
                groups.push(target.group.clone());
            }
        }
        Ok(Self { targets, groups })
    }

    /// Targets in catalog order: group order, then entry order.
    pub fn list_targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets the given provider is able to serve.
    pub fn targets_for(&self, provider: ProviderKind) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|target| match provider {
                ProviderKind::OpenMeteo => true,
                ProviderKind::Noaa => target.station_ref.is_some(),
            })
            .cloned()
            .collect()
    }
}

pub struct CatalogLoader;

impl CatalogLoader {
    pub fn resolve(path: Option<&Utf8Path>) -> Result<Catalog, BackfillError> {
        let catalog_path = match path {
            Some(path) => path.to_path_buf(),
            None => Utf8PathBuf::from(DEFAULT_CATALOG_PATH),
        };

        let content = fs::read_to_string(catalog_path.as_std_path())
            .map_err(|_| BackfillError::CatalogRead(catalog_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Catalog, BackfillError> {
        let file: CatalogFile = serde_json::from_str(content)
            .map_err(|err| BackfillError::CatalogParse(err.to_string()))?;
        Self::resolve_catalog(file)
    }

    pub fn resolve_catalog(file: CatalogFile) -> Result<Catalog, BackfillError> {
        let schema_version = file.schema_version.unwrap_or(CATALOG_SCHEMA_VERSION);
        if schema_version != CATALOG_SCHEMA_VERSION {
            return Err(BackfillError::CatalogSchema {
                found: schema_version,
                supported: CATALOG_SCHEMA_VERSION,
            });
        }

        let mut targets = Vec::new();
        for group in file.groups {
            let name = group.name.trim().to_string();
            if name.is_empty() {
                return Err(BackfillError::EmptyGroupName);
            }
            for entry in group.targets {
                let target = match entry {
                    TargetEntry::Shorthand(id, latitude, longitude, display_name) => Target {
                        id: id.parse::<TargetId>()?,
                        latitude,
                        longitude,
                        display_name,
                        group: name.clone(),
                        station_ref: None,
                    },
                    TargetEntry::Detailed(obj) => Target {
                        id: obj.id.parse::<TargetId>()?,
                        latitude: obj.latitude,
                        longitude: obj.longitude,
                        display_name: obj.name,
                        group: name.clone(),
                        station_ref: obj
                            .station_ref
                            .map(|value| value.trim().to_string())
                            .filter(|value| !value.is_empty()),
                    },
                };
                targets.push(target);
            }
        }

        Catalog::new(targets)
    }
}

fn validate_coordinates(target: &Target) -> Result<(), BackfillError> {
    let lat_ok = target.latitude.is_finite() && (-90.0..=90.0).contains(&target.latitude);
    let lon_ok = target.longitude.is_finite() && (-180.0..=180.0).contains(&target.longitude);
    if !lat_ok || !lon_ok {
        return Err(BackfillError::InvalidCoordinates {
            id: target.id.to_string(),
            latitude: target.latitude,
            longitude: target.longitude,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_catalog_shorthand_and_detailed() {
        let catalog = CatalogLoader::parse(
            r#"{
                "groups": [
                    {"name": "Northwoods", "targets": [
                        ["phelps_wi", 46.06, -89.08, "Phelps, WI"],
                        {"id": "marquette_mi", "latitude": 46.54, "longitude": -87.40,
                         "name": "Marquette, MI", "station_ref": "USW00014838"}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.groups(), ["Northwoods".to_string()]);
        let targets = catalog.list_targets();
        assert_eq!(targets[0].id.as_str(), "phelps_wi");
        assert_eq!(targets[0].station_ref, None);
        assert_eq!(targets[1].station_ref.as_deref(), Some("USW00014838"));
        assert_eq!(catalog.targets_for(ProviderKind::Noaa).len(), 1);
        assert_eq!(catalog.targets_for(ProviderKind::OpenMeteo).len(), 2);
    }
}
