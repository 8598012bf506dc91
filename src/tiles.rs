//! Uniform grid over the dataset bounds. Every tile knows the ways that
//! cross it, so a viewport only has to look at the tiles it overlaps.

use std::sync::Arc;

use log::info;

use crate::data::geometry::DRect;
use crate::data::osm::{NodeIdx, Way, WayIdx};
use crate::data::OsmData;
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

/// A way as seen from one tile. `span` lists every tile holding the way and
/// is shared between all of them.
#[derive(Debug, Clone)]
pub struct TileWay {
    pub way: WayIdx,
    pub span: Arc<[TileId]>,
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub id: TileId,
    pub rect: DRect,
    pub ways: Vec<TileWay>,
}

#[derive(Debug)]
pub struct TileIndex {
    origin_x: f64,
    origin_y: f64,
    d_lon: f64,
    d_lat: f64,
    x_num: usize,
    y_num: usize,
    tiles: Vec<Tile>,
}

impl TileIndex {
    pub fn new(bounds: &DRect, d_lon: f64, d_lat: f64) -> Result<TileIndex> {
        if !(d_lon > 0.0 && d_lat > 0.0) {
            return Err(format!("Tile size must be positive, got {} x {}", d_lon, d_lat).into());
        }
        if bounds.is_empty() {
            return Err("Cannot build a tile index over empty bounds".into());
        }
        let x_num = ((bounds.w / d_lon).ceil() as usize).max(1);
        let y_num = ((bounds.h / d_lat).ceil() as usize).max(1);
        let count = x_num.checked_mul(y_num)
            .filter(|&c| c < u32::MAX as usize)
            .ok_or("Too many tiles for the given tile size")?;

        let mut tiles = Vec::with_capacity(count);
        for y in 0..y_num {
            for x in 0..x_num {
                tiles.push(Tile {
                    id: TileId(tiles.len() as u32),
                    rect: DRect::new(
                        bounds.x + x as f64 * d_lon,
                        bounds.y + y as f64 * d_lat,
                        d_lon,
                        d_lat,
                    ),
                    ways: Vec::new(),
                });
            }
        }

        Ok(TileIndex {
            origin_x: bounds.x,
            origin_y: bounds.y,
            d_lon,
            d_lat,
            x_num,
            y_num,
            tiles,
        })
    }

    pub fn x_num(&self) -> usize {
        self.x_num
    }

    pub fn y_num(&self) -> usize {
        self.y_num
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile(&self, id: TileId) -> &Tile {
        &self.tiles[id.0 as usize]
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }

    /// Grid cell of a coordinate, clamped to the grid.
    pub fn index_of(&self, lon: f64, lat: f64) -> (usize, usize) {
        let clamp = |v: f64, num: usize| {
            if v.is_nan() || v < 0.0 {
                0
            } else {
                (v as usize).min(num - 1)
            }
        };
        (
            clamp(((lon - self.origin_x) / self.d_lon).floor(), self.x_num),
            clamp(((lat - self.origin_y) / self.d_lat).floor(), self.y_num),
        )
    }

    fn id_at(&self, x: usize, y: usize) -> TileId {
        TileId((y * self.x_num + x) as u32)
    }

    /// Every tile of the grid sub-rectangle covering `rect`. This is a
    /// superset; callers test the tile rectangle themselves.
    pub fn query_rect(&self, rect: &DRect) -> Vec<TileId> {
        if rect.is_empty() {
            return Vec::new();
        }
        let (x_min, y_min) = self.index_of(rect.x, rect.y);
        let (x_max, y_max) = self.index_of(rect.right(), rect.top());
        let mut ret = Vec::with_capacity((x_max - x_min + 1) * (y_max - y_min + 1));
        for y in y_min..=y_max {
            for x in x_min..=x_max {
                ret.push(self.id_at(x, y));
            }
        }
        ret
    }

    /// Puts every way of `data` into each tile its point sequence touches.
    pub fn assign_ways(&mut self, data: &OsmData) {
        for tile in &mut self.tiles {
            tile.ways.clear();
        }

        let mut assigned = 0usize;
        for (idx, way) in data.ways() {
            let bbox = way.nodes.bbox(data);
            if bbox.is_empty() {
                continue;
            }
            let span: Vec<TileId> = self.query_rect(&bbox)
                .into_iter()
                .filter(|&t| way.nodes.intersects(data, &self.tile(t).rect))
                .collect();
            if span.is_empty() {
                continue;
            }
            let span: Arc<[TileId]> = Arc::from(span);
            for &t in span.iter() {
                self.tiles[t.0 as usize].ways.push(TileWay { way: idx, span: span.clone() });
            }
            assigned += 1;
        }

        let max_per_tile = self.tiles.iter().map(|t| t.ways.len()).max().unwrap_or(0);
        info!(
            tiles = self.tiles.len(),
            x_num = self.x_num,
            y_num = self.y_num,
            ways = assigned,
            max_ways_per_tile = max_per_tile;
            "Built tile index"
        );
    }

    /// Nearest resolved node among the accepted ways of the tile containing
    /// the point, with its squared distance.
    pub fn closest_node(
        &self,
        data: &OsmData,
        lon: f64,
        lat: f64,
        accept: impl Fn(&Way) -> bool,
    ) -> Option<(NodeIdx, f64)> {
        let (x, y) = self.index_of(lon, lat);
        let mut found: Option<(NodeIdx, f64)> = None;
        for tile_way in &self.tile(self.id_at(x, y)).ways {
            let way = data.way(tile_way.way);
            if !accept(way) {
                continue;
            }
            if let Some((node, d)) = way.nodes.closest_node(data, lon, lat) {
                if found.map_or(true, |(_, best)| d < best) {
                    found = Some((node, d));
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::data::tests::sample;

    #[test]
    fn grid_uses_ceiling() {
        let index = TileIndex::new(&DRect::new(0.0, 0.0, 1.0, 0.5), 0.3, 0.25).unwrap();
        assert_eq!(index.x_num(), 4);
        assert_eq!(index.y_num(), 2);
        assert_eq!(index.len(), 8);
        assert!(TileIndex::new(&DRect::new(0.0, 0.0, 1.0, 1.0), 0.0, 1.0).is_err());
    }

    #[test]
    fn full_bounds_query_returns_every_tile_once() {
        let bounds = DRect::new(-3.0, -2.0, 6.0, 4.0);
        let index = TileIndex::new(&bounds, 1.0, 1.0).unwrap();
        let tiles = index.query_rect(&bounds);
        let unique: HashSet<_> = tiles.iter().copied().collect();
        assert_eq!(tiles.len(), index.len());
        assert_eq!(unique.len(), index.len());
    }

    #[test]
    fn negative_offsets_use_floor() {
        let index = TileIndex::new(&DRect::new(-10.0, -10.0, 20.0, 20.0), 1.0, 1.0).unwrap();
        assert_eq!(index.index_of(-9.5, -10.0), (0, 0));
        assert_eq!(index.index_of(-20.0, 50.0), (0, 19));
        let tiles = index.query_rect(&DRect::new(-0.5, -0.5, 1.0, 1.0));
        assert_eq!(tiles.len(), 4);
    }

    #[test]
    fn long_way_is_not_assigned_to_tiles_it_only_bounds() {
        let mut data = OsmData::default();
        for (id, lat, lon) in [(1, 0.0, 0.0), (2, 3.0, 3.0)] {
            data.begin_node(id, lat, lon);
            data.end_node();
        }
        data.begin_way(5);
        data.add_node_ref(1);
        data.add_node_ref(2);
        data.end_way();
        data.resolve();

        let mut index = TileIndex::new(&data.bounds(), 1.0, 1.0).unwrap();
        index.assign_ways(&data);
        let (x, y) = index.index_of(2.5, 0.5);
        assert!(index.tile(index.id_at(x, y)).ways.is_empty());
        let (x, y) = index.index_of(1.5, 1.5);
        let tile = index.tile(index.id_at(x, y));
        assert_eq!(tile.ways.len(), 1);
        assert!(tile.ways[0].span.len() >= 3);
    }

    #[test]
    fn closest_node_respects_filter() {
        let mut data = sample();
        data.resolve();
        let mut index = TileIndex::new(&data.bounds(), 2.0, 2.0).unwrap();
        index.assign_ways(&data);

        let (node, _) = index.closest_node(&data, 0.9, 0.1, |_| true).unwrap();
        assert_eq!(data.node(node).id(), 2);
        assert!(index.closest_node(&data, 0.9, 0.1, |_| false).is_none());
    }
}
