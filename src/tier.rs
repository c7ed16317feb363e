//! Tier records per play mode and the tile each one renders as.
//!
//! The synchronizer does not fetch these; callers hand over a map from play
//! mode to an optional record and register one video per video-bearing tile,
//! in [`BUTTON_MODES`] order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Play modes shown as tiles, in display order.
pub const BUTTON_MODES: [u32; 4] = [4, 5, 6, 8];

const VIDEO_TIERS: [&str; 8] = [
    "iron",
    "bronze",
    "silver",
    "gold",
    "platinum",
    "diamond",
    "master",
    "grandmaster",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier: TierName,
    #[serde(rename = "tierPoint")]
    pub tier_point: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierVisual {
    Video(String),
    Beginner,
    Amateur,
    Blank,
}

impl TierVisual {
    pub fn video_path(&self) -> Option<&str> {
        match self {
            TierVisual::Video(path) => Some(path),
            _ => None,
        }
    }
}

/// Tile for one record. Names are matched ignoring case and whitespace.
pub fn tier_visual(record: Option<&TierRecord>) -> TierVisual {
    let Some(record) = record else {
        return TierVisual::Blank;
    };
    let name: String = record
        .tier
        .name
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if let Some(tier) = VIDEO_TIERS.iter().find(|t| name.starts_with(*t)) {
        return TierVisual::Video(format!("/assets/tier/{}.mp4", tier));
    }
    if name.contains("beginner") {
        TierVisual::Beginner
    } else if name.contains("amateur") {
        TierVisual::Amateur
    } else {
        TierVisual::Blank
    }
}

/// `(mode, video path)` for every mode whose tile is a video, in button
/// order. The first entry is the sync master.
pub fn video_sources(records: &BTreeMap<u32, Option<TierRecord>>) -> Vec<(u32, String)> {
    BUTTON_MODES
        .iter()
        .filter_map(|mode| {
            let record = records.get(mode).and_then(Option::as_ref);
            tier_visual(record)
                .video_path()
                .map(|p| (*mode, p.to_string()))
        })
        .collect()
}
