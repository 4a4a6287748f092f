//! Quick-access favorite slots.
//!
//! Nine fixed slots per country.  The persisted form is a versioned list of
//! `{index, station}` records; decoding is tolerant per slot so one corrupt
//! record never wipes the others.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::Station;

pub const FAVORITE_SLOTS: usize = 9;
pub const FAVORITES_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FavoriteSlots {
    slots: [Option<Station>; FAVORITE_SLOTS],
}

#[derive(Debug, Serialize, Deserialize)]
struct FavoritesFile {
    version: u32,
    slots: Vec<SlotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotRecord {
    index: usize,
    station: Station,
}

impl FavoriteSlots {
    pub fn get(&self, slot: usize) -> Option<&Station> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Overwrites whatever the slot held before.
    pub fn set(&mut self, slot: usize, station: Station) -> anyhow::Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| anyhow::anyhow!("favorite slot {} out of range", slot))?;
        *entry = Some(station);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Station)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn filled(&self) -> usize {
        self.iter().count()
    }

    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        let file = FavoritesFile {
            version: FAVORITES_VERSION,
            slots: self
                .iter()
                .map(|(index, station)| SlotRecord {
                    index,
                    station: station.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    /// Never fails: unreadable input yields empty slots, unreadable records
    /// leave their slot empty.
    pub fn deserialize(bytes: &[u8]) -> Self {
        let mut out = Self::default();

        let root: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("favorites: unreadable data, starting empty: {}", e);
                return out;
            }
        };

        let version = root.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version != u64::from(FAVORITES_VERSION) {
            debug!("favorites: version {} (expected {})", version, FAVORITES_VERSION);
        }

        let Some(records) = root.get("slots").and_then(|v| v.as_array()) else {
            warn!("favorites: no slot list present");
            return out;
        };

        for raw in records {
            match serde_json::from_value::<SlotRecord>(raw.clone()) {
                Ok(rec) if rec.index < FAVORITE_SLOTS => {
                    out.slots[rec.index] = Some(rec.station);
                }
                Ok(rec) => warn!("favorites: dropping out-of-range slot {}", rec.index),
                Err(e) => warn!("favorites: dropping corrupt slot record: {}", e),
            }
        }
        out
    }
}
