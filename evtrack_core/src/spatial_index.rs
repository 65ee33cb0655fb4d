//! Grid-quantized lookup from screen position to cluster.
//!
//! Each cell holds at most one `ClusterKey`: the cluster most recently placed
//! there. Two clusters quantizing to the same cell shadow each other (last
//! writer wins). The cell size is configured well below the typical cluster
//! radius, so this lossy behavior is accepted in exchange for O(1) lookup on
//! the batch path.
//!
//! The index stores generational handles, never references. A handle whose
//! cluster has been removed from the arena simply fails to resolve.

use crate::cluster::ClusterKey;
use crate::event::Event;
use nalgebra::Vector2;
use slotmap::SecondaryMap;

/// Fixed-size grid of `Option<ClusterKey>` plus a reverse map for O(1) removal.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    shift: u32,
    size_x: u32,
    size_y: u32,
    cols: usize,
    rows: usize,
    cells: Vec<Option<ClusterKey>>,
    cell_of: SecondaryMap<ClusterKey, usize>,
}

impl SpatialIndex {
    /// Create an index for a `size_x × size_y` sensor with cells of
    /// `1 << shift` pixels.
    pub fn new(size_x: u32, size_y: u32, shift: u32) -> Self {
        let cell = 1usize << shift;
        let cols = (size_x.max(1) as usize).div_ceil(cell);
        let rows = (size_y.max(1) as usize).div_ceil(cell);
        Self {
            shift,
            size_x: size_x.max(1),
            size_y: size_y.max(1),
            cols,
            rows,
            cells: vec![None; cols * rows],
            cell_of: SecondaryMap::new(),
        }
    }

    #[inline]
    fn cell_index(&self, x: usize, y: usize) -> Option<usize> {
        let col = x >> self.shift;
        let row = y >> self.shift;
        if col < self.cols && row < self.rows {
            Some(row * self.cols + col)
        } else {
            None
        }
    }

    /// Cluster currently occupying the event's cell, if any.
    #[inline]
    pub fn find_near(&self, event: &Event) -> Option<ClusterKey> {
        let idx = self.cell_index(event.x as usize, event.y as usize)?;
        self.cells[idx]
    }

    /// Place `key` at `location` (clamped into the grid), vacating its
    /// previous cell.
    pub fn update(&mut self, key: ClusterKey, location: Vector2<f64>) {
        self.vacate(key);

        let x = location.x.clamp(0.0, (self.size_x - 1) as f64) as usize;
        let y = location.y.clamp(0.0, (self.size_y - 1) as f64) as usize;
        if let Some(idx) = self.cell_index(x, y) {
            self.cells[idx] = Some(key);
            self.cell_of.insert(key, idx);
        }
    }

    /// Evict `key` from the index.
    pub fn remove(&mut self, key: ClusterKey) {
        self.vacate(key);
    }

    fn vacate(&mut self, key: ClusterKey) {
        if let Some(idx) = self.cell_of.remove(key) {
            // The cell may since have been overwritten by another cluster.
            if self.cells[idx] == Some(key) {
                self.cells[idx] = None;
            }
        }
    }

    /// Clear every cell.
    pub fn reset(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.cell_of.clear();
    }

    /// Cell last written for `key`, if it is indexed.
    pub fn cell_of(&self, key: ClusterKey) -> Option<usize> {
        self.cell_of.get(key).copied()
    }

    pub fn contains(&self, key: ClusterKey) -> bool {
        self.cell_of.contains_key(key)
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|c| c.is_none())
    }

    /// Iterate over the keys currently occupying a cell.
    pub fn occupants(&self) -> impl Iterator<Item = ClusterKey> + '_ {
        self.cells.iter().filter_map(|c| *c)
    }

    pub fn stats(&self) -> SpatialIndexStats {
        SpatialIndexStats {
            total_cells: self.cells.len(),
            occupied_cells: self.len(),
            indexed_clusters: self.cell_of.len(),
            cell_size: 1 << self.shift,
        }
    }
}

/// Statistics about the spatial index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialIndexStats {
    pub total_cells: usize,
    pub occupied_cells: usize,
    /// Clusters with a reverse entry (shadowed ones included)
    pub indexed_clusters: usize,
    pub cell_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use slotmap::SlotMap;

    fn keys(n: usize) -> (SlotMap<ClusterKey, ()>, Vec<ClusterKey>) {
        let mut arena = SlotMap::with_key();
        let keys = (0..n).map(|_| arena.insert(())).collect();
        (arena, keys)
    }

    #[test]
    fn test_grid_dimensions() {
        let index = SpatialIndex::new(346, 260, 2);
        let stats = index.stats();
        assert_eq!(stats.total_cells, 87 * 65);
        assert_eq!(stats.cell_size, 4);
        assert!(index.is_empty());
    }

    #[test]
    fn test_update_then_find() {
        let (_arena, k) = keys(1);
        let mut index = SpatialIndex::new(128, 128, 2);
        index.update(k[0], Vector2::new(41.3, 17.9));

        // Any event in the same 4×4 cell resolves to the cluster
        assert_eq!(index.find_near(&Event::new(40, 16, 0, true)), Some(k[0]));
        assert_eq!(index.find_near(&Event::new(43, 19, 0, true)), Some(k[0]));
        assert_eq!(index.find_near(&Event::new(44, 16, 0, true)), None);
    }

    #[test]
    fn test_update_moves_entry() {
        let (_arena, k) = keys(1);
        let mut index = SpatialIndex::new(128, 128, 2);
        index.update(k[0], Vector2::new(10.0, 10.0));
        index.update(k[0], Vector2::new(100.0, 100.0));

        assert_eq!(index.find_near(&Event::new(10, 10, 0, true)), None);
        assert_eq!(index.find_near(&Event::new(100, 100, 0, true)), Some(k[0]));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_clears_cell() {
        let (_arena, k) = keys(1);
        let mut index = SpatialIndex::new(128, 128, 2);
        index.update(k[0], Vector2::new(10.0, 10.0));
        index.remove(k[0]);
        assert_eq!(index.find_near(&Event::new(10, 10, 0, true)), None);
        assert!(!index.contains(k[0]));
        // Removing twice is harmless
        index.remove(k[0]);
    }

    #[test]
    fn test_shadowing_last_writer_wins() {
        let (_arena, k) = keys(2);
        let mut index = SpatialIndex::new(128, 128, 3);
        index.update(k[0], Vector2::new(8.0, 8.0));
        index.update(k[1], Vector2::new(9.0, 9.0));
        assert_eq!(index.find_near(&Event::new(8, 8, 0, true)), Some(k[1]));

        // Removing the shadowed cluster must not evict the occupant
        index.remove(k[0]);
        assert_eq!(index.find_near(&Event::new(8, 8, 0, true)), Some(k[1]));
    }

    #[test]
    fn test_out_of_frame_location_is_clamped() {
        let (_arena, k) = keys(2);
        let mut index = SpatialIndex::new(128, 128, 2);
        index.update(k[0], Vector2::new(-12.0, 500.0));
        assert_eq!(index.find_near(&Event::new(0, 127, 0, true)), Some(k[0]));
        index.update(k[1], Vector2::new(f64::NAN, 3.0));
        assert_eq!(index.find_near(&Event::new(0, 3, 0, true)), Some(k[1]));
    }

    #[test]
    fn test_reset() {
        let (_arena, k) = keys(3);
        let mut index = SpatialIndex::new(64, 64, 2);
        for (i, key) in k.iter().enumerate() {
            index.update(*key, Vector2::new(i as f64 * 10.0, 5.0));
        }
        index.reset();
        assert!(index.is_empty());
        assert_eq!(index.stats().indexed_clusters, 0);
    }

    #[test]
    fn test_event_outside_grid() {
        let index = SpatialIndex::new(16, 16, 2);
        assert_eq!(index.find_near(&Event::new(200, 3, 0, true)), None);
    }

    proptest! {
        #[test]
        fn prop_find_after_update(ops in prop::collection::vec((0usize..4, 0.0f64..128.0, 0.0f64..128.0), 1..50)) {
            let (_arena, k) = keys(4);
            let mut index = SpatialIndex::new(128, 128, 2);
            for (i, x, y) in ops {
                index.update(k[i], Vector2::new(x, y));
                let probe = Event::new(x as u16, y as u16, 0, true);
                prop_assert_eq!(index.find_near(&probe), Some(k[i]));

                // Every occupant's reverse entry points back at its cell
                for key in index.occupants() {
                    let cell = index.cell_of(key);
                    prop_assert!(cell.is_some());
                }
            }
            for key in &k {
                index.remove(*key);
            }
            prop_assert!(index.is_empty());
        }
    }
}
