//! Spatial indexing abstractions for node neighborhood queries.
//!
//! The kernel resolves connectivity with an exact pairwise predicate; the
//! index only narrows the candidate set. Queries therefore operate on the
//! first two spatial components; a projected distance never exceeds the
//! full Euclidean distance, so no in-range candidate is ever dropped.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from projected node positions.
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError>;

    /// Visit candidates near `node_idx` whose projected squared distance is
    /// within `radius_sq`. The visited index is never `node_idx` itself.
    fn neighbors_within(
        &self,
        node_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    );
}

/// Uniform grid bucketing positions into square cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing nodes.
    pub cell_size: f64,
    #[serde(skip)]
    buckets: HashMap<(i64, i64), Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f64, f64)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            buckets: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Number of positions captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when the index holds no positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    fn cell_of(&self, position: (f64, f64)) -> (i64, i64) {
        (
            (position.0 / self.cell_size).floor() as i64,
            (position.1 / self.cell_size).floor() as i64,
        )
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f64, f64)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        self.buckets.values_mut().for_each(Vec::clear);
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &position) in positions.iter().enumerate() {
            let cell = self.cell_of(position);
            self.buckets.entry(cell).or_default().push(idx);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        node_idx: usize,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f64>),
    ) {
        let Some(&origin) = self.positions.get(node_idx) else {
            return;
        };
        if radius_sq < 0.0 {
            return;
        }
        let reach = (radius_sq.sqrt() / self.cell_size).ceil() as i64;
        let (cx, cy) = self.cell_of(origin);
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let Some(bucket) = self.buckets.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &other in bucket {
                    if other == node_idx {
                        continue;
                    }
                    let (ox, oy) = self.positions[other];
                    let ddx = ox - origin.0;
                    let ddy = oy - origin.1;
                    let dist_sq = ddx * ddx + ddy * ddy;
                    if dist_sq <= radius_sq {
                        visitor(other, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_neighbors(index: &UniformGridIndex, idx: usize, radius_sq: f64) -> Vec<usize> {
        let mut found = Vec::new();
        index.neighbors_within(idx, radius_sq, &mut |other, _dist| found.push(other));
        found.sort_unstable();
        found
    }

    #[test]
    fn rebuild_rejects_non_positive_cell_size() {
        let mut index = UniformGridIndex::new(0.0);
        assert!(index.rebuild(&[(0.0, 0.0)]).is_err());
    }

    #[test]
    fn grid_matches_brute_force() {
        let positions: Vec<(f64, f64)> = (0..40)
            .map(|i| {
                let i = i as f64;
                ((i * 37.0) % 500.0, (i * 59.0) % 500.0)
            })
            .collect();
        let mut index = UniformGridIndex::new(60.0);
        index.rebuild(&positions).expect("rebuild");

        let radius_sq = 100.0 * 100.0;
        for idx in 0..positions.len() {
            let brute: Vec<usize> = positions
                .iter()
                .enumerate()
                .filter(|&(other, &(x, y))| {
                    if other == idx {
                        return false;
                    }
                    let dx = x - positions[idx].0;
                    let dy = y - positions[idx].1;
                    dx * dx + dy * dy <= radius_sq
                })
                .map(|(other, _)| other)
                .collect();
            assert_eq!(collect_neighbors(&index, idx, radius_sq), brute);
        }
    }

    #[test]
    fn query_excludes_self_and_out_of_range() {
        let mut index = UniformGridIndex::new(25.0);
        index
            .rebuild(&[(0.0, 0.0), (30.0, 0.0), (200.0, 0.0)])
            .expect("rebuild");
        assert_eq!(collect_neighbors(&index, 0, 50.0 * 50.0), vec![1]);
        assert!(collect_neighbors(&index, 2, 50.0 * 50.0).is_empty());
    }

    #[test]
    fn negative_coordinates_bucket_correctly() {
        let mut index = UniformGridIndex::new(10.0);
        index
            .rebuild(&[(-5.0, -5.0), (-12.0, -5.0), (5.0, 5.0)])
            .expect("rebuild");
        assert_eq!(collect_neighbors(&index, 0, 10.0 * 10.0), vec![1]);
    }
}
