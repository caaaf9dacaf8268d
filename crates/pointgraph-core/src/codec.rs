//! # Node Codec
//!
//! Decodes a `NodeEdge` into a typed record through a static table that
//! maps point types to field setters. Each record type declares its table
//! once; unknown point types are ignored and missing ones keep the
//! record's `Default`.

use crate::types::{NodeEdge, Point};

/// One entry of a decode table.
pub struct Field<T> {
    /// Point type this entry consumes.
    pub point_type: &'static str,
    /// Setter applied with the matching point.
    pub apply: fn(&mut T, &Point),
}

impl<T> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("point_type", &self.point_type)
            .finish_non_exhaustive()
    }
}

/// A record that can be decoded from a node's points.
pub trait Decode: Default + Sized + 'static {
    /// Decode table, consulted in order for every point.
    const FIELDS: &'static [Field<Self>];

    /// Store the node ID.
    fn set_id(&mut self, id: &str);
}

/// Decode the node half of a `NodeEdge`.
///
/// Points are applied in their snapshot order, so for a point type with
/// several keys the last key wins unless the setter looks at the key.
#[must_use]
pub fn decode<T: Decode>(node: &NodeEdge) -> T {
    decode_points(&node.id, &node.points)
}

/// Decode a bare point list.
#[must_use]
pub fn decode_points<T: Decode>(id: &str, points: &[Point]) -> T {
    let mut out = T::default();
    out.set_id(id);
    for point in points {
        for field in T::FIELDS {
            if field.point_type == point.point_type {
                (field.apply)(&mut out, point);
            }
        }
    }
    out
}
