use super::geometry::DRect;
use super::id_store::Identified;
use super::tags::TagIndex;
use super::OsmData;

pub type OsmId = u64;

/// Fixed point scale of the stored coordinates.
pub const LONLAT_RESOLUTION: f64 = 0x7FFF_FFFF as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Node,
    Way,
    Relation,
}

/// Positions in the graph store arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WayIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outer = 0,
    Inner = 1,
}

impl Role {
    pub fn from_byte(byte: u8) -> Option<Role> {
        match byte {
            0 => Some(Role::Outer),
            1 => Some(Role::Inner),
            _ => None,
        }
    }

    pub fn parse(role: &str) -> Role {
        if role == "inner" {
            Role::Inner
        } else {
            Role::Outer
        }
    }
}

/// The tagged id record shared by every feature kind.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: OsmId,
    pub kind: FeatureKind,
    tags: Vec<TagIndex>,
}

impl Element {
    pub fn new(id: OsmId, kind: FeatureKind) -> Self {
        Element { id, kind, tags: Vec::new() }
    }

    pub fn add_tag(&mut self, tag: TagIndex) {
        self.tags.push(tag);
    }

    /// Most recently added first.
    pub fn tags(&self) -> impl Iterator<Item = &TagIndex> + '_ {
        self.tags.iter().rev()
    }

    pub fn tags_oldest_first(&self) -> &[TagIndex] {
        &self.tags
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn has_tag(&self, query: &TagIndex) -> bool {
        self.tags.iter().any(|t| query.matches(t))
    }

    /// Moves all of `other`'s tags onto this element, leaving `other` untagged.
    pub fn steal_tags(&mut self, other: &mut Element) {
        self.tags.append(&mut other.tags);
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub element: Element,
    ilat: i32,
    ilon: i32,
}

impl Node {
    pub fn new(id: OsmId, lat: f64, lon: f64) -> Self {
        let mut lon = lon;
        while lon > 180.0 {
            lon -= 360.0;
        }
        while lon < -180.0 {
            lon += 360.0;
        }
        let lat = lat.clamp(-90.0, 90.0);
        Node {
            element: Element::new(id, FeatureKind::Node),
            ilat: (lat / 90.0 * LONLAT_RESOLUTION).round() as i32,
            ilon: (lon / 180.0 * LONLAT_RESOLUTION).round() as i32,
        }
    }

    pub fn id(&self) -> OsmId {
        self.element.id
    }

    pub fn lat(&self) -> f64 {
        self.ilat as f64 / LONLAT_RESOLUTION * 90.0
    }

    pub fn lon(&self) -> f64 {
        self.ilon as f64 / LONLAT_RESOLUTION * 180.0
    }

    pub fn dist_squared(&self, lon: f64, lat: f64) -> f64 {
        let dx = self.lon() - lon;
        let dy = self.lat() - lat;
        dx * dx + dy * dy
    }
}

/// Node references of a way-like feature. `refs` holds the raw ids from
/// loading and is released once every id resolved; `resolved` has one slot
/// per id, `None` marking a hole.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    refs: Vec<OsmId>,
    resolved: Vec<Option<NodeIdx>>,
}

impl NodeList {
    pub fn add_ref(&mut self, id: OsmId) {
        self.refs.push(id);
    }

    pub fn refs(&self) -> &[OsmId] {
        &self.refs
    }

    pub fn resolved(&self) -> &[Option<NodeIdx>] {
        &self.resolved
    }

    pub fn len(&self) -> usize {
        self.refs.len().max(self.resolved.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks every raw id up. `None` when there is nothing to resolve.
    pub(super) fn lookup(&self, data: &OsmData) -> Option<Vec<Option<NodeIdx>>> {
        if self.refs.is_empty() {
            return None;
        }
        Some(self.refs.iter().map(|&id| data.find_node(id)).collect())
    }

    /// Installs the result of [`NodeList::lookup`] and returns the number of
    /// holes. The raw ids are released when there are none.
    pub(super) fn set_resolved(&mut self, resolved: Vec<Option<NodeIdx>>) -> usize {
        let missing = resolved.iter().filter(|n| n.is_none()).count();
        self.resolved = resolved;
        if missing == 0 {
            self.refs = Vec::new();
        }
        missing
    }

    /// Node ids in order, from the raw references if still held.
    pub fn ids(&self, data: &OsmData) -> Vec<OsmId> {
        if !self.refs.is_empty() {
            return self.refs.clone();
        }
        self.resolved.iter()
            .flatten()
            .map(|&n| data.node(n).id())
            .collect()
    }

    pub fn bbox(&self, data: &OsmData) -> DRect {
        let mut rect = DRect::empty();
        for &n in self.resolved.iter().flatten() {
            let node = data.node(n);
            rect.include(node.lon(), node.lat());
        }
        rect
    }

    /// Whether any node lies in `rect` or any segment between two present
    /// consecutive nodes crosses it. A hole breaks the chain.
    pub fn intersects(&self, data: &OsmData, rect: &DRect) -> bool {
        let mut prev: Option<(f64, f64)> = None;
        for slot in &self.resolved {
            let Some(n) = slot else {
                prev = None;
                continue;
            };
            let node = data.node(*n);
            let (x, y) = (node.lon(), node.lat());
            if rect.contains_closed(x, y) {
                return true;
            }
            if let Some((px, py)) = prev {
                if rect.intersects_segment(px, py, x, y) {
                    return true;
                }
            }
            prev = Some((x, y));
        }
        false
    }

    /// Closest resolved node with its squared distance.
    pub fn closest_node(&self, data: &OsmData, lon: f64, lat: f64) -> Option<(NodeIdx, f64)> {
        let mut found: Option<(NodeIdx, f64)> = None;
        for &n in self.resolved.iter().flatten() {
            let d = data.node(n).dist_squared(lon, lat);
            if found.map_or(true, |(_, best)| d < best) {
                found = Some((n, d));
            }
        }
        found
    }
}

#[derive(Debug, Clone)]
pub struct Way {
    pub element: Element,
    pub nodes: NodeList,
}

impl Way {
    pub fn new(id: OsmId) -> Self {
        Way {
            element: Element::new(id, FeatureKind::Way),
            nodes: NodeList::default(),
        }
    }

    pub fn id(&self) -> OsmId {
        self.element.id
    }
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub element: Element,
    pub nodes: NodeList,
    way_refs: Vec<OsmId>,
    ways: Vec<Option<WayIdx>>,
    roles: Vec<Role>,
}

impl Relation {
    pub fn new(id: OsmId) -> Self {
        Relation {
            element: Element::new(id, FeatureKind::Relation),
            nodes: NodeList::default(),
            way_refs: Vec::new(),
            ways: Vec::new(),
            roles: Vec::new(),
        }
    }

    pub fn id(&self) -> OsmId {
        self.element.id
    }

    pub fn add_way_ref(&mut self, id: OsmId, role: Role) {
        self.way_refs.push(id);
        self.roles.push(role);
    }

    /// Resolved members with their roles, holes included.
    pub fn members(&self) -> impl Iterator<Item = (Option<WayIdx>, Role)> + '_ {
        self.ways.iter().copied().zip(self.roles.iter().copied())
    }

    pub fn num_members(&self) -> usize {
        self.roles.len()
    }

    /// Member way ids with their roles, from the raw references if still held.
    pub fn member_ids(&self, data: &OsmData) -> Vec<(OsmId, Role)> {
        if !self.way_refs.is_empty() {
            return self.way_refs.iter().copied().zip(self.roles.iter().copied()).collect();
        }
        self.members()
            .filter_map(|(w, role)| w.map(|w| (data.way(w).id(), role)))
            .collect()
    }

    pub(super) fn lookup_ways(&self, data: &OsmData) -> Option<Vec<Option<WayIdx>>> {
        if self.way_refs.is_empty() {
            return None;
        }
        Some(self.way_refs.iter().map(|&id| data.find_way(id)).collect())
    }

    /// Returns the number of holes left among the member ways.
    pub(super) fn set_resolved_ways(&mut self, ways: Vec<Option<WayIdx>>) -> usize {
        let missing = ways.iter().filter(|w| w.is_none()).count();
        self.ways = ways;
        if missing == 0 {
            self.way_refs = Vec::new();
        }
        missing
    }

    /// The single outer member, if exactly one member has the outer role.
    pub fn sole_outer(&self) -> Option<Option<WayIdx>> {
        let mut outer = self.roles.iter()
            .enumerate()
            .filter(|(_, &role)| role == Role::Outer)
            .map(|(i, _)| i);
        let first = outer.next()?;
        if outer.next().is_some() {
            return None;
        }
        Some(self.ways.get(first).copied().flatten())
    }

    /// Own nodes plus every resolved member way.
    pub fn bbox(&self, data: &OsmData) -> DRect {
        self.ways.iter()
            .flatten()
            .fold(self.nodes.bbox(data), |rect, &w| rect.union(&data.way(w).nodes.bbox(data)))
    }
}

impl Identified for Node {
    fn osm_id(&self) -> OsmId {
        self.element.id
    }
}

impl Identified for Way {
    fn osm_id(&self) -> OsmId {
        self.element.id
    }
}

impl Identified for Relation {
    fn osm_id(&self) -> OsmId {
        self.element.id
    }
}

/// Borrowed view on any stored feature.
#[derive(Debug, Clone, Copy)]
pub enum Feature<'a> {
    Node(&'a Node),
    Way(&'a Way),
    Relation(&'a Relation),
}

impl<'a> Feature<'a> {
    pub fn element(&self) -> &'a Element {
        match self {
            Feature::Node(n) => &n.element,
            Feature::Way(w) => &w.element,
            Feature::Relation(r) => &r.element,
        }
    }

    pub fn kind(&self) -> FeatureKind {
        self.element().kind
    }

    pub fn id(&self) -> OsmId {
        self.element().id
    }
}
