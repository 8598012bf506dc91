pub mod binary;
pub mod geometry;
pub mod id_store;
pub mod osm;
pub mod tags;

use std::collections::HashMap;

use log::{debug, info};
use serde::Deserialize;

use self::geometry::DRect;
use self::id_store::{ChainStatistics, IdStore};
use self::osm::{Feature, FeatureKind, Node, NodeIdx, OsmId, RelIdx, Relation, Role, Way, WayIdx};
use self::tags::{TagIndex, TagStore};

/// Sizing and behaviour of a graph store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_node_bits")]
    pub node_bits: u32,
    #[serde(default = "StoreConfig::default_way_bits")]
    pub way_bits: u32,
    #[serde(default = "StoreConfig::default_relation_bits")]
    pub relation_bits: u32,
    /// Resolve each way and relation as soon as it is closed.
    #[serde(default)]
    pub eager_resolve: bool,
    #[serde(default = "StoreConfig::default_skip_attributes")]
    pub skip_attributes: bool,
}

impl StoreConfig {
    fn default_node_bits() -> u32 { 20 }
    fn default_way_bits() -> u32 { 16 }
    fn default_relation_bits() -> u32 { 16 }
    fn default_skip_attributes() -> bool { true }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            node_bits: Self::default_node_bits(),
            way_bits: Self::default_way_bits(),
            relation_bits: Self::default_relation_bits(),
            eager_resolve: false,
            skip_attributes: Self::default_skip_attributes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Top,
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub unresolved_nodes: usize,
    pub unresolved_ways: usize,
    pub stolen_tags: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreStatistics {
    pub nodes: ChainStatistics,
    pub ways: ChainStatistics,
    pub relations: ChainStatistics,
}

/// Nodes, ways and relations as read from an .osm file, cross linked by a
/// resolve pass. Elements are built one at a time through the
/// begin/add/end calls; anything else is a programming error and panics.
#[derive(Debug)]
pub struct OsmData {
    pub tags: TagStore,
    nodes: IdStore<Node>,
    ways: IdStore<Way>,
    relations: IdStore<Relation>,
    relations_of_way: HashMap<WayIdx, Vec<RelIdx>>,
    bounds: DRect,
    state: BuildState,
    config: StoreConfig,
}

impl Default for OsmData {
    fn default() -> Self {
        OsmData::new(StoreConfig::default())
    }
}

impl OsmData {
    pub fn new(config: StoreConfig) -> Self {
        OsmData {
            tags: TagStore::new(),
            nodes: IdStore::new(config.node_bits),
            ways: IdStore::new(config.way_bits),
            relations: IdStore::new(config.relation_bits),
            relations_of_way: HashMap::new(),
            bounds: DRect::empty(),
            state: BuildState::Top,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn expect_state(&self, allowed: &[BuildState], operation: &str) {
        if !allowed.contains(&self.state) {
            panic!("{} called in state {:?}", operation, self.state);
        }
    }

    pub fn begin_node(&mut self, id: OsmId, lat: f64, lon: f64) {
        self.expect_state(&[BuildState::Top], "begin_node");
        let node = Node::new(id, lat, lon);
        self.bounds.include(node.lon(), node.lat());
        self.nodes.push(node);
        self.state = BuildState::Node;
    }

    pub fn end_node(&mut self) {
        self.expect_state(&[BuildState::Node], "end_node");
        self.state = BuildState::Top;
    }

    pub fn begin_way(&mut self, id: OsmId) {
        self.expect_state(&[BuildState::Top], "begin_way");
        self.ways.push(Way::new(id));
        self.state = BuildState::Way;
    }

    pub fn end_way(&mut self) {
        self.expect_state(&[BuildState::Way], "end_way");
        self.state = BuildState::Top;
        if self.config.eager_resolve && !self.ways.is_empty() {
            self.resolve_way(WayIdx(self.ways.len() as u32 - 1));
        }
    }

    pub fn begin_relation(&mut self, id: OsmId) {
        self.expect_state(&[BuildState::Top], "begin_relation");
        self.relations.push(Relation::new(id));
        self.state = BuildState::Relation;
    }

    pub fn end_relation(&mut self) {
        self.expect_state(&[BuildState::Relation], "end_relation");
        self.state = BuildState::Top;
        if self.config.eager_resolve && !self.relations.is_empty() {
            self.resolve_relation(RelIdx(self.relations.len() as u32 - 1));
        }
    }

    pub fn add_node_ref(&mut self, id: OsmId) {
        self.expect_state(&[BuildState::Way, BuildState::Relation], "add_node_ref");
        match self.state {
            BuildState::Way => {
                if let Some(way) = self.ways.last_mut() {
                    way.nodes.add_ref(id);
                }
            },
            _ => {
                if let Some(relation) = self.relations.last_mut() {
                    relation.nodes.add_ref(id);
                }
            },
        }
    }

    pub fn add_way_ref(&mut self, id: OsmId, role: Role) {
        self.expect_state(&[BuildState::Relation], "add_way_ref");
        if let Some(relation) = self.relations.last_mut() {
            relation.add_way_ref(id, role);
        }
    }

    pub fn add_tag(&mut self, key: &str, value: &str) {
        self.expect_state(&[BuildState::Node, BuildState::Way, BuildState::Relation], "add_tag");
        let tag = self.tags.find_or_intern(key, Some(value));
        self.add_tag_index(tag);
    }

    pub(crate) fn add_tag_index(&mut self, tag: TagIndex) {
        let element = match self.state {
            BuildState::Node => self.nodes.last_mut().map(|n| &mut n.element),
            BuildState::Way => self.ways.last_mut().map(|w| &mut w.element),
            BuildState::Relation => self.relations.last_mut().map(|r| &mut r.element),
            BuildState::Top => None,
        };
        if let Some(element) = element {
            element.add_tag(tag);
        }
    }

    /// Element metadata stored as a tag with an `@` prefixed key, unless
    /// attributes are skipped.
    pub fn add_attribute(&mut self, key: &str, value: &str) {
        self.expect_state(&[BuildState::Node, BuildState::Way, BuildState::Relation], "add_attribute");
        if self.config.skip_attributes {
            return;
        }
        self.add_tag(&format!("@{}", key), value);
    }

    fn resolve_way(&mut self, way: WayIdx) -> usize {
        let resolved = self.ways.get(way.0).nodes.lookup(self);
        match resolved {
            Some(resolved) => self.ways.get_mut(way.0).nodes.set_resolved(resolved),
            None => 0,
        }
    }

    fn resolve_relation(&mut self, rel: RelIdx) -> ResolveSummary {
        let mut summary = ResolveSummary::default();
        let resolved = self.relations.get(rel.0).nodes.lookup(self);
        if let Some(resolved) = resolved {
            summary.unresolved_nodes = self.relations.get_mut(rel.0).nodes.set_resolved(resolved);
        }

        let ways = self.relations.get(rel.0).lookup_ways(self);
        let Some(ways) = ways else {
            return summary;
        };
        for &way in ways.iter().flatten() {
            let back_links = self.relations_of_way.entry(way).or_default();
            if !back_links.contains(&rel) {
                back_links.push(rel);
            }
        }
        summary.unresolved_ways = self.relations.get_mut(rel.0).set_resolved_ways(ways);

        let relation = self.relations.get(rel.0);
        let multipolygon = self.tags.find("type", Some("multipolygon"))
            .map_or(false, |t| relation.element.has_tag(&t));
        if relation.element.has_tags() && !multipolygon {
            return summary;
        }
        if let Some(Some(outer)) = relation.sole_outer() {
            let way = self.ways.get_mut(outer.0);
            if way.element.has_tags() {
                summary.stolen_tags = way.element.tags_oldest_first().len();
                self.relations.get_mut(rel.0).element.steal_tags(&mut way.element);
            }
        }
        summary
    }

    /// Links ids to arena positions: every way first, then every relation.
    /// Calling it again gives the same result.
    pub fn resolve(&mut self) -> ResolveSummary {
        let mut summary = ResolveSummary::default();
        for w in 0..self.ways.len() {
            summary.unresolved_nodes += self.resolve_way(WayIdx(w as u32));
        }
        for r in 0..self.relations.len() {
            let rel = self.resolve_relation(RelIdx(r as u32));
            summary.unresolved_nodes += rel.unresolved_nodes;
            summary.unresolved_ways += rel.unresolved_ways;
            summary.stolen_tags += rel.stolen_tags;
        }
        info!(
            ways = self.ways.len(),
            relations = self.relations.len(),
            unresolved_nodes = summary.unresolved_nodes,
            unresolved_ways = summary.unresolved_ways;
            "Resolved references"
        );
        summary
    }

    pub fn find_node(&self, id: OsmId) -> Option<NodeIdx> {
        self.nodes.find(id).map(NodeIdx)
    }

    pub fn find_way(&self, id: OsmId) -> Option<WayIdx> {
        self.ways.find(id).map(WayIdx)
    }

    pub fn find_relation(&self, id: OsmId) -> Option<RelIdx> {
        self.relations.find(id).map(RelIdx)
    }

    pub fn lookup_by_id(&self, kind: FeatureKind, id: OsmId) -> Option<Feature<'_>> {
        match kind {
            FeatureKind::Node => self.find_node(id).map(|n| Feature::Node(self.node(n))),
            FeatureKind::Way => self.find_way(id).map(|w| Feature::Way(self.way(w))),
            FeatureKind::Relation => self.find_relation(id).map(|r| Feature::Relation(self.relation(r))),
        }
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        self.nodes.get(idx.0)
    }

    pub fn way(&self, idx: WayIdx) -> &Way {
        self.ways.get(idx.0)
    }

    pub fn relation(&self, idx: RelIdx) -> &Relation {
        self.relations.get(idx.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn ways(&self) -> impl Iterator<Item = (WayIdx, &Way)> {
        self.ways.iter().enumerate().map(|(i, w)| (WayIdx(i as u32), w))
    }

    pub fn relations(&self) -> impl Iterator<Item = (RelIdx, &Relation)> {
        self.relations.iter().enumerate().map(|(i, r)| (RelIdx(i as u32), r))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_ways(&self) -> usize {
        self.ways.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    /// Relations that list this way as a member, in resolve order.
    pub fn relations_of_way(&self, way: WayIdx) -> &[RelIdx] {
        self.relations_of_way.get(&way).map_or(&[], Vec::as_slice)
    }

    /// Lon/lat box around every node added so far.
    pub fn bounds(&self) -> DRect {
        self.bounds
    }

    pub fn statistics(&self) -> StoreStatistics {
        StoreStatistics {
            nodes: self.nodes.statistics(),
            ways: self.ways.statistics(),
            relations: self.relations.statistics(),
        }
    }

    pub fn log_statistics(&self) {
        let stats = self.statistics();
        debug!(
            node_avg = stats.nodes.average,
            node_std_dev = stats.nodes.std_dev,
            node_max = stats.nodes.max,
            way_avg = stats.ways.average,
            way_std_dev = stats.ways.std_dev,
            way_max = stats.ways.max,
            relation_avg = stats.relations.average,
            relation_std_dev = stats.relations.std_dev,
            relation_max = stats.relations.max;
            "Id table chain lengths"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Square of four nodes as one closed way (10), an open way (11) with a
    /// missing node, and a multipolygon relation (20) around way 10.
    pub(crate) fn sample() -> OsmData {
        sample_with(StoreConfig::default(), false)
    }

    fn add_sample_ways(data: &mut OsmData) {
        data.begin_way(10);
        for id in [1, 2, 3, 4, 1] {
            data.add_node_ref(id);
        }
        data.add_tag("landuse", "forest");
        data.end_way();

        data.begin_way(11);
        for id in [1, 99, 3] {
            data.add_node_ref(id);
        }
        data.add_tag("highway", "track");
        data.end_way();
    }

    fn add_sample_relation(data: &mut OsmData) {
        data.begin_relation(20);
        data.add_way_ref(10, Role::Outer);
        data.add_way_ref(12, Role::Inner);
        data.add_tag("type", "multipolygon");
        data.end_relation();
    }

    /// The sample graph, optionally with the relation loaded before its
    /// member ways.
    fn sample_with(config: StoreConfig, relation_first: bool) -> OsmData {
        let mut data = OsmData::new(config);
        for (id, lat, lon) in [(1, 0.0, 0.0), (2, 0.0, 1.0), (3, 1.0, 1.0), (4, 1.0, 0.0)] {
            data.begin_node(id, lat, lon);
            data.end_node();
        }
        if relation_first {
            add_sample_relation(&mut data);
            add_sample_ways(&mut data);
        } else {
            add_sample_ways(&mut data);
            add_sample_relation(&mut data);
        }
        data
    }

    type WayState = (OsmId, Vec<OsmId>, Vec<Option<NodeIdx>>, Vec<TagIndex>, Vec<RelIdx>);
    type RelationState = (OsmId, Vec<(Option<WayIdx>, Role)>, Vec<(OsmId, Role)>, Vec<Option<NodeIdx>>, Vec<TagIndex>);

    /// Everything resolution can change, in arena order.
    fn resolved_state(data: &OsmData) -> (Vec<WayState>, Vec<RelationState>) {
        let ways = data.ways()
            .map(|(idx, way)| (
                way.id(),
                way.nodes.refs().to_vec(),
                way.nodes.resolved().to_vec(),
                way.element.tags_oldest_first().to_vec(),
                data.relations_of_way(idx).to_vec(),
            ))
            .collect();
        let relations = data.relations()
            .map(|(_, relation)| (
                relation.id(),
                relation.members().collect(),
                relation.member_ids(data),
                relation.nodes.resolved().to_vec(),
                relation.element.tags_oldest_first().to_vec(),
            ))
            .collect();
        (ways, relations)
    }

    fn eager() -> StoreConfig {
        StoreConfig { eager_resolve: true, ..StoreConfig::default() }
    }

    #[test]
    fn resolve_releases_fully_resolved_refs() {
        let mut data = sample();
        let summary = data.resolve();
        assert_eq!(summary.unresolved_nodes, 1);
        assert_eq!(summary.unresolved_ways, 1);

        let closed = data.way(data.find_way(10).unwrap());
        assert!(closed.nodes.refs().is_empty());
        assert_eq!(closed.nodes.resolved().len(), 5);
        assert!(closed.nodes.resolved().iter().all(Option::is_some));

        let open = data.way(data.find_way(11).unwrap());
        assert_eq!(open.nodes.refs(), &[1, 99, 3]);
        assert_eq!(open.nodes.resolved()[1], None);
    }

    #[test]
    fn multipolygon_steals_outer_tags() {
        let mut data = sample();
        data.resolve();
        let way = data.find_way(10).unwrap();
        let rel = data.find_relation(20).unwrap();
        assert!(!data.way(way).element.has_tags());
        let landuse = data.tags.find("landuse", None).unwrap();
        assert!(data.relation(rel).element.has_tag(&landuse));
        assert_eq!(data.relations_of_way(way), &[rel]);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut data = sample();
        data.resolve();
        let rel = data.find_relation(20).unwrap();
        let tags_before = data.relation(rel).element.tags_oldest_first().to_vec();
        let second = data.resolve();
        assert_eq!(second.stolen_tags, 0);
        assert_eq!(data.relation(rel).element.tags_oldest_first(), tags_before.as_slice());
        assert_eq!(data.relations_of_way(data.find_way(10).unwrap()).len(), 1);
    }

    #[test]
    fn eager_resolution_matches_bulk() {
        for relation_first in [false, true] {
            let mut eager = sample_with(eager(), relation_first);
            let mut bulk = sample_with(StoreConfig::default(), relation_first);
            eager.resolve();
            bulk.resolve();
            assert_eq!(resolved_state(&eager), resolved_state(&bulk), "relation_first = {}", relation_first);
        }

        let bulk = {
            let mut data = sample();
            data.resolve();
            data
        };
        let way = bulk.find_way(10).unwrap();
        let rel = bulk.find_relation(20).unwrap();
        assert_eq!(bulk.relations_of_way(way), &[rel]);
        assert!(!bulk.way(way).element.has_tags());
    }

    #[test]
    fn eager_resolution_repairs_relations_loaded_first() {
        let mut data = sample_with(eager(), true);
        let way = data.find_way(10).unwrap();
        let rel = data.find_relation(20).unwrap();

        assert!(data.way(way).nodes.refs().is_empty());
        assert!(data.relation(rel).members().all(|(w, _)| w.is_none()));
        assert!(data.relations_of_way(way).is_empty());
        assert!(data.way(way).element.has_tags());

        let summary = data.resolve();
        assert_eq!(summary.unresolved_ways, 1);
        assert_eq!(data.relation(rel).members().next(), Some((Some(way), Role::Outer)));
        assert_eq!(data.relations_of_way(way), &[rel]);
        assert!(!data.way(way).element.has_tags());
        let landuse = data.tags.find("landuse", Some("forest")).unwrap();
        assert!(data.relation(rel).element.has_tag(&landuse));
    }

    #[test]
    fn tagged_non_multipolygon_keeps_its_own_tags() {
        let mut data = OsmData::default();
        data.begin_way(1);
        data.add_tag("building", "yes");
        data.end_way();
        data.begin_relation(2);
        data.add_way_ref(1, Role::Outer);
        data.add_tag("type", "route");
        data.end_relation();
        data.resolve();
        assert!(data.way(WayIdx(0)).element.has_tags());
    }

    #[test]
    fn lookup_by_id_and_bounds() {
        let data = sample();
        assert!(matches!(data.lookup_by_id(FeatureKind::Way, 11), Some(Feature::Way(_))));
        assert!(data.lookup_by_id(FeatureKind::Relation, 11).is_none());
        let bounds = data.bounds();
        assert!(bounds.x.abs() < 1e-6 && bounds.y.abs() < 1e-6);
        assert!((bounds.w - 1.0).abs() < 1e-6 && (bounds.h - 1.0).abs() < 1e-6);
    }

    #[test]
    fn attributes_are_prefixed_unless_skipped() {
        let mut data = OsmData::new(StoreConfig { skip_attributes: false, ..StoreConfig::default() });
        data.begin_node(1, 0.0, 0.0);
        data.add_attribute("user", "alice");
        data.end_node();
        assert!(data.tags.find("@user", Some("alice")).is_some());

        let mut data = OsmData::default();
        data.begin_node(1, 0.0, 0.0);
        data.add_attribute("user", "alice");
        data.end_node();
        assert!(data.tags.find("@user", None).is_none());
    }

    #[test]
    #[should_panic(expected = "add_tag called in state Top")]
    fn tag_outside_element_panics() {
        let mut data = OsmData::default();
        data.add_tag("a", "b");
    }

    #[test]
    #[should_panic]
    fn way_ref_inside_way_panics() {
        let mut data = OsmData::default();
        data.begin_way(1);
        data.add_way_ref(2, Role::Outer);
    }
}
