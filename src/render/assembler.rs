//! Joins the member ways of a multipolygon relation into rings.

use crate::data::osm::{NodeIdx, OsmId, Relation, Role, WayIdx};
use crate::data::OsmData;

use super::{PointMode, Renderer, ShapeKind};

/// Node sequence of one boundary. An open ring is a chain that could not be
/// closed and is drawn as far as it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    pub nodes: Vec<NodeIdx>,
    pub closed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembly {
    pub outer: Vec<Ring>,
    pub inner: Vec<Ring>,
}

struct Fragment {
    first: OsmId,
    last: OsmId,
    nodes: Vec<NodeIdx>,
}

impl Fragment {
    /// Endpoints are taken from the resolved points so that a join never
    /// happens on a node that is not drawn.
    fn new(data: &OsmData, way: WayIdx) -> Option<Fragment> {
        let points: Vec<NodeIdx> = data.way(way).nodes.resolved().iter().flatten().copied().collect();
        let (&first, &last) = (points.first()?, points.last()?);
        Some(Fragment {
            first: data.node(first).id(),
            last: data.node(last).id(),
            nodes: points,
        })
    }
}

/// Chains `ways` into rings. Each ring starts from the first remaining way
/// and is extended by the first remaining way touching its open end, in
/// either direction, until it returns to its start or nothing connects.
pub fn assemble_rings(data: &OsmData, ways: &[WayIdx]) -> Vec<Ring> {
    let mut remaining: Vec<Fragment> = ways.iter()
        .filter_map(|&w| Fragment::new(data, w))
        .collect();
    let mut rings = Vec::new();

    while !remaining.is_empty() {
        let seed = remaining.remove(0);
        if seed.first == seed.last {
            let closing = seed.nodes.first() != seed.nodes.last();
            let mode = if closing { PointMode::RepeatFirst } else { PointMode::Normal };
            rings.push(Ring { nodes: mode.select(&seed.nodes), closed: true });
            continue;
        }

        let mut chain = seed.nodes;
        let mut end = seed.last;
        while end != seed.first {
            let Some(pos) = remaining.iter().position(|f| f.first == end || f.last == end) else {
                break;
            };
            let mut next = remaining.remove(pos);
            if next.first == end {
                end = next.last;
            } else {
                next.nodes.reverse();
                end = next.first;
            }
            chain.extend(PointMode::SkipFirst.select(&next.nodes));
        }
        rings.push(Ring { nodes: chain, closed: end == seed.first });
    }
    rings
}

impl Assembly {
    /// Splits the resolved members of `relation` by role and assembles both.
    pub fn of_relation(data: &OsmData, relation: &Relation) -> Assembly {
        let mut outer = Vec::new();
        let mut inner = Vec::new();
        for (way, role) in relation.members() {
            match (way, role) {
                (Some(w), Role::Outer) => outer.push(w),
                (Some(w), Role::Inner) => inner.push(w),
                (None, _) => (),
            }
        }
        Assembly {
            outer: assemble_rings(data, &outer),
            inner: assemble_rings(data, &inner),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outer.is_empty() && self.inner.is_empty()
    }

    /// Emits one multipolygon holding every ring.
    pub fn render(&self, data: &OsmData, renderer: &mut dyn Renderer, layer: usize) {
        renderer.begin_shape(ShapeKind::Multipolygon, layer);
        let rings = self.outer.iter()
            .map(|r| (ShapeKind::Outer, r))
            .chain(self.inner.iter().map(|r| (ShapeKind::Inner, r)));
        for (kind, ring) in rings {
            renderer.begin_shape(kind, layer);
            for &n in &ring.nodes {
                let node = data.node(n);
                renderer.add_point(node.lon(), node.lat(), 0.0, 0.0);
            }
            renderer.end_shape();
        }
        renderer.end_shape();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::recording::{Event, RecordingRenderer};

    fn graph(ways: &[(OsmId, Vec<OsmId>)]) -> OsmData {
        let mut data = OsmData::default();
        for id in 1..=6u64 {
            data.begin_node(id, id as f64, (id * id) as f64);
            data.end_node();
        }
        for (id, refs) in ways {
            data.begin_way(*id);
            for &r in refs {
                data.add_node_ref(r);
            }
            data.end_way();
        }
        data.resolve();
        data
    }

    fn ids(data: &OsmData, ring: &Ring) -> Vec<OsmId> {
        ring.nodes.iter().map(|&n| data.node(n).id()).collect()
    }

    #[test]
    fn triangle_closes_for_every_order() {
        let data = graph(&[(10, vec![1, 2]), (11, vec![2, 3]), (12, vec![3, 1])]);
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let ways: Vec<_> = order.iter().map(|&i| WayIdx(i)).collect();
            let rings = assemble_rings(&data, &ways);
            assert_eq!(rings.len(), 1);
            assert!(rings[0].closed);
            assert_eq!(rings[0].nodes.len(), 4);
            let ring = ids(&data, &rings[0]);
            assert_eq!(ring.first(), ring.last());
        }
        let rings = assemble_rings(&data, &[WayIdx(0), WayIdx(1), WayIdx(2)]);
        assert_eq!(ids(&data, &rings[0]), vec![1, 2, 3, 1]);
    }

    #[test]
    fn reversed_fragments_are_flipped() {
        let data = graph(&[(10, vec![1, 2, 3]), (11, vec![5, 4, 3]), (12, vec![5, 1])]);
        let rings = assemble_rings(&data, &[WayIdx(0), WayIdx(1), WayIdx(2)]);
        assert_eq!(rings.len(), 1);
        assert_eq!(ids(&data, &rings[0]), vec![1, 2, 3, 4, 5, 1]);
        assert!(rings[0].closed);
    }

    #[test]
    fn closed_way_is_its_own_ring() {
        let data = graph(&[(10, vec![1, 2, 3, 1]), (11, vec![4, 5, 6, 4])]);
        let rings = assemble_rings(&data, &[WayIdx(0), WayIdx(1)]);
        assert_eq!(rings.len(), 2);
        assert_eq!(ids(&data, &rings[1]), vec![4, 5, 6, 4]);
    }

    #[test]
    fn broken_chain_stays_open() {
        let data = graph(&[(10, vec![1, 2]), (11, vec![2, 3]), (12, vec![4, 5])]);
        let rings = assemble_rings(&data, &[WayIdx(0), WayIdx(1), WayIdx(2)]);
        assert_eq!(rings.len(), 2);
        assert!(!rings[0].closed);
        assert_eq!(ids(&data, &rings[0]), vec![1, 2, 3]);
        assert_eq!(ids(&data, &rings[1]), vec![4, 5]);
    }

    #[test]
    fn missing_end_nodes_do_not_join() {
        let data = graph(&[(10, vec![1, 2, 99]), (11, vec![99, 3, 1])]);
        let rings = assemble_rings(&data, &[WayIdx(0), WayIdx(1)]);
        assert_eq!(rings.len(), 2);
        assert_eq!(ids(&data, &rings[0]), vec![1, 2]);
        assert_eq!(ids(&data, &rings[1]), vec![3, 1]);
        assert!(rings.iter().all(|r| !r.closed));
    }

    #[test]
    fn relation_renders_as_one_multipolygon() {
        let mut data = graph(&[(10, vec![1, 2, 3, 1]), (11, vec![4, 5, 6, 4]), (12, vec![1, 6])]);
        data.begin_relation(20);
        data.add_way_ref(10, Role::Outer);
        data.add_way_ref(11, Role::Inner);
        data.add_way_ref(99, Role::Inner);
        data.end_relation();
        data.resolve();

        let relation = data.relation(data.find_relation(20).unwrap());
        let assembly = Assembly::of_relation(&data, relation);
        assert_eq!(assembly.outer.len(), 1);
        assert_eq!(assembly.inner.len(), 1);

        let mut renderer = RecordingRenderer::new(4);
        assembly.render(&data, &mut renderer, 2);
        assert_eq!(renderer.shapes(), vec![
            (ShapeKind::Multipolygon, 2),
            (ShapeKind::Outer, 2),
            (ShapeKind::Inner, 2),
        ]);
        assert_eq!(renderer.events.last(), Some(&Event::End));
        assert_eq!(renderer.events.iter().filter(|e| **e == Event::End).count(), 3);
    }
}
