//! # Last-Write-Wins Merge
//!
//! The pure merge rule behind every point write.
//!
//! A point is applied iff its `time` is strictly newer than the stored
//! point with the same `(Type, Key)`. Equal or older points are no-ops,
//! which makes the merge idempotent and, for distinct timestamps,
//! independent of arrival order.

use crate::types::{Point, PointKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Latest point per `(Type, Key)` of one owner.
pub type PointSet = BTreeMap<PointKey, Point>;

/// Merge `incoming` into `stored`.
///
/// Returns the applied points in first-application order. When several
/// points of the batch hit the same key, only the surviving one is
/// reported, in the slot of the first applied point for that key.
pub fn merge_points(stored: &mut PointSet, incoming: &[Point]) -> Vec<Point> {
    let mut applied: Vec<Point> = Vec::new();
    let mut slots: BTreeMap<PointKey, usize> = BTreeMap::new();

    for point in incoming {
        let key = point.point_key();
        let newer = stored
            .get(&key)
            .is_none_or(|existing| point.time > existing.time);
        if !newer {
            continue;
        }

        stored.insert(key.clone(), point.clone());
        match slots.get(&key) {
            Some(&slot) => applied[slot] = point.clone(),
            None => {
                slots.insert(key, applied.len());
                applied.push(point.clone());
            }
        }
    }

    applied
}

/// Replace unset timestamps with `now`.
pub fn stamp_unset(points: &mut [Point], now: DateTime<Utc>) {
    for point in points.iter_mut().filter(|p| p.has_unset_time()) {
        point.time = now;
    }
}

/// Deterministic snapshot ordered by `(Type, Key)`.
#[must_use]
pub fn snapshot(set: &PointSet) -> Vec<Point> {
    set.values().cloned().collect()
}
