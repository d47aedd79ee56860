// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// Tunables for the physical memory core.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PhysConfig {
    /// Attempt 2MB backing for eligible RAM windows.
    #[serde(default)]
    pub large_pages: bool,
    /// Capacity of the pre-zeroed handy page pool.
    #[serde(default = "default_handy_pages")]
    pub handy_pages: usize,
    /// Replenish the pool from the host provider when it drops to this
    /// many pages.
    #[serde(default = "default_handy_low_water")]
    pub handy_low_water: usize,
}

fn default_handy_pages() -> usize {
    128
}

fn default_handy_low_water() -> usize {
    32
}

impl Default for PhysConfig {
    fn default() -> Self {
        PhysConfig {
            large_pages: false,
            handy_pages: default_handy_pages(),
            handy_low_water: default_handy_low_water(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PhysConfig::default();
        assert!(config.handy_low_water < config.handy_pages);
        assert!(!config.large_pages);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: PhysConfig = serde_json::from_str("{\"large_pages\":true}").unwrap();
        assert!(config.large_pages);
        assert_eq!(config.handy_pages, 128);
    }
}
