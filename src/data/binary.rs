//! Flat record stream used to reload a parsed graph without going through XML.
//!
//! Layout after the magic string, all numbers little endian:
//!
//! ```text
//! 'N' id:u64 lat:f64 lon:f64 tags
//! 'W' id:u64 n:u32 n*(id:u64) tags
//! 'R' id:u64 n:u32 n*(id:u64) m:u32 m*(id:u64 role:u8) tags
//! tags = count:u32 count*(key NUL value NUL)
//! ```

use std::io::{self, BufRead, Read, Write};

use log::info;

use crate::errors::{Error, Result};

use super::osm::{Element, OsmId, Role};
use super::{OsmData, StoreConfig};

pub const MAGIC: &[u8] = b"OsmBrowserCachev2.0\x04";

const NODE: u8 = b'N';
const WAY: u8 = b'W';
const RELATION: u8 = b'R';

fn write_u32(w: &mut impl Write, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_f64(w: &mut impl Write, value: f64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_count(w: &mut impl Write, count: usize) -> Result<()> {
    write_u32(w, u32::try_from(count)?)
}

fn write_tags(w: &mut impl Write, data: &OsmData, element: &Element) -> Result<()> {
    let tags = element.tags_oldest_first();
    write_count(w, tags.len())?;
    for &tag in tags {
        w.write_all(data.tags.key(tag).as_bytes())?;
        w.write_all(&[0])?;
        w.write_all(data.tags.value(tag).unwrap_or("").as_bytes())?;
        w.write_all(&[0])?;
    }
    Ok(())
}

fn write_node_refs(w: &mut impl Write, ids: &[OsmId]) -> Result<()> {
    write_count(w, ids.len())?;
    for &id in ids {
        write_u64(w, id)?;
    }
    Ok(())
}

pub fn write_binary(data: &OsmData, w: &mut impl Write) -> Result<()> {
    w.write_all(MAGIC)?;

    for node in data.nodes() {
        w.write_all(&[NODE])?;
        write_u64(w, node.id())?;
        write_f64(w, node.lat())?;
        write_f64(w, node.lon())?;
        write_tags(w, data, &node.element)?;
    }

    for (_, way) in data.ways() {
        w.write_all(&[WAY])?;
        write_u64(w, way.id())?;
        write_node_refs(w, &way.nodes.ids(data))?;
        write_tags(w, data, &way.element)?;
    }

    for (_, relation) in data.relations() {
        w.write_all(&[RELATION])?;
        write_u64(w, relation.id())?;
        write_node_refs(w, &relation.nodes.ids(data))?;
        let members = relation.member_ids(data);
        write_count(w, members.len())?;
        for (id, role) in members {
            write_u64(w, id)?;
            w.write_all(&[role as u8])?;
        }
        write_tags(w, data, &relation.element)?;
    }
    w.flush()?;

    info!(
        nodes = data.num_nodes(),
        ways = data.num_ways(),
        relations = data.num_relations();
        "Wrote binary graph"
    );
    Ok(())
}

fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        "Truncated record in binary graph".into()
    } else {
        err.into()
    }
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_f64(r: &mut impl Read) -> Result<f64> {
    Ok(f64::from_le_bytes(read_array(r)?))
}

fn read_string(r: &mut impl BufRead, buf: &mut Vec<u8>) -> Result<String> {
    buf.clear();
    r.read_until(0, buf)?;
    if buf.pop() != Some(0) {
        return Err("Truncated string in binary graph".into());
    }
    Ok(String::from_utf8(buf.clone())?)
}

fn read_tags(r: &mut impl BufRead, data: &mut OsmData, buf: &mut Vec<u8>) -> Result<()> {
    let count = read_u32(r)?;
    for _ in 0..count {
        let key = read_string(r, buf)?;
        let value = read_string(r, buf)?;
        data.add_tag(&key, &value);
    }
    Ok(())
}

/// Reads a whole stream into a fresh, unresolved store. Any error discards
/// what was read so far.
pub fn read_binary(r: &mut impl BufRead, config: StoreConfig) -> Result<OsmData> {
    let mut magic = vec![0u8; MAGIC.len()];
    r.read_exact(&mut magic).map_err(truncated)?;
    if magic != MAGIC {
        return Err("Binary graph has wrong magic or version".into());
    }

    let mut data = OsmData::new(config);
    let mut buf = Vec::new();
    loop {
        let mut tag = [0u8; 1];
        if r.read(&mut tag)? == 0 {
            break;
        }
        match tag[0] {
            NODE => {
                let id = read_u64(r)?;
                let lat = read_f64(r)?;
                let lon = read_f64(r)?;
                data.begin_node(id, lat, lon);
                read_tags(r, &mut data, &mut buf)?;
                data.end_node();
            },
            WAY => {
                data.begin_way(read_u64(r)?);
                for _ in 0..read_u32(r)? {
                    data.add_node_ref(read_u64(r)?);
                }
                read_tags(r, &mut data, &mut buf)?;
                data.end_way();
            },
            RELATION => {
                data.begin_relation(read_u64(r)?);
                for _ in 0..read_u32(r)? {
                    data.add_node_ref(read_u64(r)?);
                }
                for _ in 0..read_u32(r)? {
                    let id = read_u64(r)?;
                    let [role] = read_array::<1>(r)?;
                    let role = Role::from_byte(role)
                        .ok_or_else(|| Error::from(format!("Unknown member role {} in binary graph", role)))?;
                    data.add_way_ref(id, role);
                }
                read_tags(r, &mut data, &mut buf)?;
                data.end_relation();
            },
            other => return Err(format!("Unknown record type {:#04x} in binary graph", other).into()),
        }
    }
    Ok(data)
}
