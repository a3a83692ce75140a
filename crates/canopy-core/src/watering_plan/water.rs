// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Water demand of a plan.

use crate::model::TreeCluster;

/// Litres needed to water every cluster once.
pub fn total_water_required(clusters: &[TreeCluster]) -> f64 {
    clusters.iter().map(|c| c.expected_litres()).sum()
}

/// Depot refills needed on top of the first fill.
pub fn refills(total_water: f64, rig_capacity: f64) -> i32 {
    if rig_capacity <= 0.0 || total_water <= 0.0 {
        return 0;
    }
    let fills = (total_water / rig_capacity).ceil() as i32;
    (fills - 1).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_support::cluster;

    #[test]
    fn test_total_sums_size_classes() {
        let clusters = vec![cluster(1, None, 1), cluster(2, None, 7), cluster(3, None, 0)];
        assert_eq!(total_water_required(&clusters), 400.0 + 1200.0);
        assert_eq!(total_water_required(&[]), 0.0);
    }

    #[test]
    fn test_refills() {
        assert_eq!(refills(0.0, 3000.0), 0);
        assert_eq!(refills(800.0, 3000.0), 0);
        assert_eq!(refills(3000.0, 3000.0), 0);
        assert_eq!(refills(3001.0, 3000.0), 1);
        assert_eq!(refills(7200.0, 2000.0), 3);
        assert_eq!(refills(500.0, 0.0), 0);
    }
}
