use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str;

use log::info;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use xz::bufread::XzDecoder;

use crate::config::UserConfig;
use crate::data::binary::{read_binary, write_binary};
use crate::data::osm::{FeatureKind, OsmId, Role};
use crate::data::{OsmData, StoreConfig};
use crate::errors::Result;

use super::{remove_if_exists, Etl};

pub const ETL_NAME: &str = "parse_osm";
const PROGRESS_EVERY: u64 = 1_000_000;

/// Where the binary graph for `data_path` lives inside `dir`.
pub fn output_path(data_path: &str, dir: &Path) -> PathBuf {
    let name = Path::new(data_path)
        .file_name()
        .map_or_else(|| "graph".into(), |n| n.to_string_lossy().into_owned());
    let name = name.strip_suffix(".cache").unwrap_or(&name).to_string();
    dir.join(format!("{}.cache", name))
}

#[derive(Default)]
struct ElementAttributes {
    id: Option<OsmId>,
    lat: Option<f64>,
    lon: Option<f64>,
    metadata: Vec<(String, String)>,
}

impl ElementAttributes {
    fn read(el: &BytesStart) -> Result<ElementAttributes> {
        let mut ret = ElementAttributes::default();
        for attribute in el.attributes() {
            let attribute = attribute?;
            let value = attribute.unescape_value()?;
            match attribute.key.as_ref() {
                b"id" => ret.id = Some(value.parse()?),
                b"lat" => ret.lat = Some(value.parse()?),
                b"lon" => ret.lon = Some(value.parse()?),
                key => ret.metadata.push((str::from_utf8(key)?.to_string(), value.into_owned())),
            }
        }
        Ok(ret)
    }

    fn id(&self, element: &str) -> Result<OsmId> {
        self.id.ok_or_else(|| format!("Missing id on <{}>", element).into())
    }
}

/// First attribute named `key`, unescaped.
fn attribute(el: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for attribute in el.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == key {
            return Ok(Some(attribute.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn required(el: &BytesStart, key: &[u8]) -> Result<String> {
    attribute(el, key)?.ok_or_else(|| {
        format!(
            "Missing {} on <{}>",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(el.name().as_ref()),
        ).into()
    })
}

/// Feeds OSM XML events into a graph store. Structure errors in the input
/// are reported as errors before they reach the store.
struct OsmXmlBuilder {
    data: OsmData,
    open: Option<FeatureKind>,
    elements: u64,
}

impl OsmXmlBuilder {
    fn begin(&mut self, kind: FeatureKind, el: &BytesStart, empty: bool) -> Result<()> {
        if let Some(open) = self.open {
            return Err(format!("<{:?}> opened inside <{:?}>", kind, open).into());
        }
        let attributes = ElementAttributes::read(el)?;
        match kind {
            FeatureKind::Node => {
                let (Some(lat), Some(lon)) = (attributes.lat, attributes.lon) else {
                    return Err(format!("Node {:?} without coordinates", attributes.id).into());
                };
                self.data.begin_node(attributes.id("node")?, lat, lon);
            },
            FeatureKind::Way => self.data.begin_way(attributes.id("way")?),
            FeatureKind::Relation => self.data.begin_relation(attributes.id("relation")?),
        }
        for (key, value) in &attributes.metadata {
            self.data.add_attribute(key, value);
        }
        self.open = Some(kind);
        if empty {
            self.end(kind)?;
        }
        Ok(())
    }

    fn end(&mut self, kind: FeatureKind) -> Result<()> {
        if self.open != Some(kind) {
            return Err(format!("Unbalanced end of <{:?}>", kind).into());
        }
        match kind {
            FeatureKind::Node => self.data.end_node(),
            FeatureKind::Way => self.data.end_way(),
            FeatureKind::Relation => self.data.end_relation(),
        }
        self.open = None;
        self.elements += 1;
        if self.elements % PROGRESS_EVERY == 0 {
            info!(
                elements = self.elements,
                nodes = self.data.num_nodes(),
                ways = self.data.num_ways(),
                relations = self.data.num_relations();
                "Parsing"
            );
            self.data.log_statistics();
        }
        Ok(())
    }

    fn child(&mut self, el: &BytesStart) -> Result<()> {
        let name = el.name();
        let name = name.as_ref();
        if !matches!(name, b"nd" | b"tag" | b"member") {
            return Ok(());
        }
        let Some(open) = self.open else {
            return Err(format!("<{}> outside of an element", String::from_utf8_lossy(name)).into());
        };
        match (name, open) {
            (b"tag", _) => {
                let key = required(el, b"k")?;
                let value = attribute(el, b"v")?.unwrap_or_default();
                self.data.add_tag(&key, &value);
            },
            (b"nd", FeatureKind::Way) => self.data.add_node_ref(required(el, b"ref")?.parse()?),
            (b"member", FeatureKind::Relation) => {
                let id: OsmId = required(el, b"ref")?.parse()?;
                match attribute(el, b"type")?.as_deref() {
                    Some("way") => {
                        let role = attribute(el, b"role")?.unwrap_or_default();
                        self.data.add_way_ref(id, Role::parse(&role));
                    },
                    Some("node") => self.data.add_node_ref(id),
                    _ => (),
                }
            },
            _ => (),
        }
        Ok(())
    }
}

fn kind_of(name: &[u8]) -> Option<FeatureKind> {
    match name {
        b"node" => Some(FeatureKind::Node),
        b"way" => Some(FeatureKind::Way),
        b"relation" => Some(FeatureKind::Relation),
        _ => None,
    }
}

/// Builds an unresolved graph store from OSM XML.
pub fn parse_osm_xml(input: impl BufRead, config: StoreConfig) -> Result<OsmData> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);
    let mut builder = OsmXmlBuilder { data: OsmData::new(config), open: None, elements: 0 };
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => match kind_of(e.name().as_ref()) {
                Some(kind) => builder.begin(kind, &e, false)?,
                None => builder.child(&e)?,
            },
            Event::Empty(e) => match kind_of(e.name().as_ref()) {
                Some(kind) => builder.begin(kind, &e, true)?,
                None => builder.child(&e)?,
            },
            Event::End(e) => {
                if let Some(kind) = kind_of(e.name().as_ref()) {
                    builder.end(kind)?;
                }
            },
            _ => (),
        }
        buf.clear();
    }
    if let Some(open) = builder.open {
        return Err(format!("Input ended inside <{:?}>", open).into());
    }
    Ok(builder.data)
}

/// Opens `path` as a graph: `.cache` files are read in the binary format,
/// everything else as XML, decompressed first when it ends in `.xz`.
pub fn read_graph(path: &Path, config: StoreConfig) -> Result<OsmData> {
    let mut file = BufReader::new(File::open(path)?);
    let name = path.to_string_lossy();
    if name.ends_with(".cache") {
        read_binary(&mut file, config)
    } else if name.ends_with(".xz") {
        parse_osm_xml(BufReader::new(XzDecoder::new(file)), config)
    } else {
        parse_osm_xml(file, config)
    }
}

pub struct ParseOsmEtl<'a> {
    config: &'a UserConfig,
}

impl ParseOsmEtl<'_> {
    pub fn new(config: &UserConfig) -> ParseOsmEtl<'_> {
        ParseOsmEtl { config }
    }

    fn output_path(&self, dir: &Path) -> PathBuf {
        output_path(&self.config.data_path, dir)
    }
}

impl Etl for ParseOsmEtl<'_> {
    type Input = OsmData;
    type Output = OsmData;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn is_cached(&self, dir: &Path) -> Result<bool> {
        Ok(self.output_path(dir).try_exists()?)
    }

    fn clean(&self, dir: &Path) -> Result<()> {
        remove_if_exists(&self.output_path(dir))
    }

    fn extract(&mut self, _dir: &Path) -> Result<Self::Input> {
        read_graph(Path::new(&self.config.data_path), self.config.store_config())
    }

    fn transform(&mut self, mut input: Self::Input) -> Result<Self::Output> {
        let summary = input.resolve();
        info!(
            nodes = input.num_nodes(),
            ways = input.num_ways(),
            relations = input.num_relations(),
            stolen_tags = summary.stolen_tags;
            "Graph loaded"
        );
        input.log_statistics();
        Ok(input)
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        let mut writer = BufWriter::new(File::create(self.output_path(dir))?);
        write_binary(&output, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="test">
  <bounds minlat="0" minlon="0" maxlat="1" maxlon="1"/>
  <node id="1" lat="0.0" lon="0.0" version="3" user="alice"/>
  <node id="2" lat="0.0" lon="1.0"/>
  <node id="3" lat="1.0" lon="1.0">
    <tag k="name" v="Fish &amp; Chips"/>
  </node>
  <way id="10">
    <nd ref="1"/>
    <nd ref="2"/>
    <nd ref="3"/>
    <nd ref="1"/>
  </way>
  <relation id="20">
    <member type="way" ref="10" role="outer"/>
    <member type="node" ref="3" role="label"/>
    <tag k="type" v="multipolygon"/>
    <tag k="natural" v="water"/>
  </relation>
</osm>"#;

    fn parse(xml: &str, skip_attributes: bool) -> Result<OsmData> {
        let config = StoreConfig { skip_attributes, ..StoreConfig::default() };
        parse_osm_xml(xml.as_bytes(), config)
    }

    #[test]
    fn builds_every_element() {
        let mut data = parse(SAMPLE, true).unwrap();
        data.resolve();
        assert_eq!((data.num_nodes(), data.num_ways(), data.num_relations()), (3, 1, 1));

        let node = data.find_node(3).unwrap();
        let name = data.tags.find("name", Some("Fish & Chips")).unwrap();
        assert!(data.node(node).element.has_tag(&name));

        let way = data.way(data.find_way(10).unwrap());
        assert_eq!(way.nodes.ids(&data), vec![1, 2, 3, 1]);

        let relation = data.relation(data.find_relation(20).unwrap());
        assert_eq!(relation.num_members(), 1);
        assert_eq!(relation.nodes.ids(&data), vec![3]);
        assert!(data.tags.find_key("@user").is_none());
    }

    #[test]
    fn attributes_become_tags_on_request() {
        let data = parse(SAMPLE, false).unwrap();
        let node = data.node(data.find_node(1).unwrap());
        let user = data.tags.find("@user", Some("alice")).unwrap();
        assert!(node.element.has_tag(&user));
        assert!(data.tags.find("@version", Some("3")).is_some());
    }

    #[test]
    fn malformed_structure_is_an_error() {
        assert!(parse(r#"<osm><nd ref="1"/></osm>"#, true).is_err());
        assert!(parse(r#"<osm><way id="1"><node id="2" lat="0" lon="0"/></way></osm>"#, true).is_err());
        assert!(parse(r#"<osm><node lat="0" lon="0"/></osm>"#, true).is_err());
        assert!(parse(r#"<osm><way id="x"/></osm>"#, true).is_err());
        assert!(parse(r#"<osm><way id="1">"#, true).is_err());
    }

    #[test]
    fn stage_writes_reloadable_cache() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sample.osm");
        std::fs::write(&input, SAMPLE).unwrap();
        let config = crate::config::parse_user_config(
            &format!(r#"{{ "data_path": {:?} }}"#, input.to_string_lossy())
        ).unwrap();

        let mut etl = ParseOsmEtl::new(&config);
        assert!(!etl.is_cached(dir.path()).unwrap());
        etl.process(dir.path()).unwrap();
        assert!(etl.is_cached(dir.path()).unwrap());

        let cache = output_path(&config.data_path, dir.path());
        assert_eq!(cache.file_name().unwrap(), "sample.osm.cache");
        let data = read_graph(&cache, StoreConfig::default()).unwrap();
        assert_eq!(data.num_ways(), 1);
        let relation = data.find_relation(20).unwrap();
        let water = data.tags.find("natural", Some("water")).unwrap();
        assert!(data.relation(relation).element.has_tag(&water));

        etl.clean(dir.path()).unwrap();
        assert!(!etl.is_cached(dir.path()).unwrap());
        etl.clean(dir.path()).unwrap();
    }
}
