//! Site profile resolution
//!
//! Maps a procedure site (and age group) to the cadence constants the planner
//! uses for each phase. The age dimension is accepted everywhere but is flat in
//! the current table: every age group resolves to the site row. It is the
//! extension point for age-specific tuning.

use serde::{Deserialize, Serialize};

use crate::types::{AgeGroup, Site};

/// Baseline cadence for a site, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
    pub settle_interval_ms: u32,
    pub peak_interval_ms: u32,
    pub cool_interval_ms: u32,
    pub jitter_ms: u32,
}

impl SiteProfile {
    /// Fallback row for sites without dedicated tuning.
    pub const DEFAULT: SiteProfile = SiteProfile {
        settle_interval_ms: 52,
        peak_interval_ms: 30,
        cool_interval_ms: 68,
        jitter_ms: 8,
    };

    const FINGERSTICK: SiteProfile = SiteProfile {
        settle_interval_ms: 38,
        peak_interval_ms: 22,
        cool_interval_ms: 55,
        jitter_ms: 6,
    };

    const SUBQ_BROAD: SiteProfile = SiteProfile {
        settle_interval_ms: 55,
        peak_interval_ms: 32,
        cool_interval_ms: 70,
        jitter_ms: 8,
    };

    const DELTOID: SiteProfile = SiteProfile {
        settle_interval_ms: 48,
        peak_interval_ms: 28,
        cool_interval_ms: 65,
        jitter_ms: 7,
    };
}

impl Default for SiteProfile {
    fn default() -> Self {
        SiteProfile::DEFAULT
    }
}

/// Resolve the cadence profile for `(site, age_group)`. Never fails.
pub fn resolve(site: Site, _age_group: AgeGroup) -> SiteProfile {
    match site {
        Site::Fingerstick => SiteProfile::FINGERSTICK,
        Site::SubqAbdomen | Site::SubqThigh => SiteProfile::SUBQ_BROAD,
        Site::SubqDeltoid | Site::ImDeltoid => SiteProfile::DELTOID,
        _ => SiteProfile::DEFAULT,
    }
}
