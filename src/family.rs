// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lookup table between UF2 family IDs and their short names.
//!
//! The built-in table is generated at compile time from `uf2families.json`. A
//! table with the same schema can also be loaded at runtime, for families
//! newer than this build. Either way, the registry is an ordinary value handed
//! to whoever needs it.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Name reported for family IDs that aren't in the table.
pub const UNKNOWN_FAMILY: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Family {
    pub id: u32,
    pub short_name: String,
    pub description: String,
}

#[derive(Clone, Debug, Default)]
pub struct FamilyRegistry {
    families: Vec<Family>,
}

impl FamilyRegistry {
    /// The table compiled into this binary.
    pub fn builtin() -> Self {
        Self {
            families: BUILTIN_FAMILIES.iter()
                .map(|&(id, name, desc)| Family {
                    id,
                    short_name: name.to_string(),
                    description: desc.to_string(),
                })
                .collect(),
        }
    }

    /// Parses a table in the upstream `uf2families.json` format. IDs may be
    /// given in hex with a `0x` prefix or in decimal.
    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<FamilyRecord> = serde_json::from_str(json)
            .map_err(|e| Error::Family(e.to_string()))?;
        let families = records.into_iter()
            .map(|r| {
                let id = match r.id.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => r.id.parse(),
                }.map_err(|_| {
                    Error::Family(format!(
                        "family {} has unparseable id {:?}",
                        r.short_name,
                        r.id,
                    ))
                })?;
                Ok(Family {
                    id,
                    short_name: r.short_name,
                    description: r.description,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { families })
    }

    /// Returns the short name for `id`, or [`UNKNOWN_FAMILY`].
    pub fn name_of(&self, id: u32) -> &str {
        self.families.iter()
            .find(|f| f.id == id)
            .map(|f| f.short_name.as_str())
            .unwrap_or(UNKNOWN_FAMILY)
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.families.iter()
            .find(|f| f.short_name.eq_ignore_ascii_case(name))
            .map(|f| f.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Family> {
        self.families.iter()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }
}

#[derive(Deserialize)]
struct FamilyRecord {
    id: String,
    short_name: String,
    description: String,
}

include!(concat!(env!("OUT_DIR"), "/uf2families.rs"));
