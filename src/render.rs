pub mod assembler;
pub mod cache;
pub mod job;
pub mod raster;
pub mod worker;

use serde::Deserialize;

use crate::data::geometry::DRect;
use crate::rules::Fingerprint;
use crate::tiles::Tile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color { r, g, b, a }
    }

    pub const fn gray(level: u8) -> Color {
        Color::rgba(level, level, level, 0xff)
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        deserializer.deserialize_str(serialize_color::ColorVisitor)
    }
}

mod serialize_color {
    use serde::de::{self, Visitor};

    use super::Color;

    pub struct ColorVisitor;

    impl<'de> Visitor<'de> for ColorVisitor {
        type Value = Color;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "a colour string of the form '#rrggbbaa'")
        }

        fn visit_str<E>(self, string: &str) -> Result<Self::Value, E> where E: de::Error {
            if string.len() != 9 || !string.is_ascii() || !string.starts_with('#') {
                return Err(de::Error::invalid_value(de::Unexpected::Str(string), &self))
            }
            let r = parse_hex_byte(&self, &string[1..3])?;
            let g = parse_hex_byte(&self, &string[3..5])?;
            let b = parse_hex_byte(&self, &string[5..7])?;
            let a = parse_hex_byte(&self, &string[7..9])?;
            Ok(Color::rgba(r, g, b, a))
        }
    }

    fn parse_hex_byte<E>(visitor: &ColorVisitor, string: &str) -> Result<u8, E> where E: de::Error {
        u8::from_str_radix(string, 16).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(string), visitor)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Polygon,
    /// Outer ring inside a multipolygon.
    Outer,
    /// Hole inside a multipolygon.
    Inner,
    /// Wraps any number of outer and inner rings.
    Multipolygon,
    Line,
}

/// Which points of a sequence to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointMode {
    Normal,
    /// All points, then the first one again to close the ring.
    RepeatFirst,
    /// All but the first, which continues an existing chain.
    SkipFirst,
    OnlyFirst,
}

impl PointMode {
    pub fn select<T: Copy>(self, points: &[T]) -> Vec<T> {
        match self {
            PointMode::Normal => points.to_vec(),
            PointMode::RepeatFirst => points.iter().chain(points.first()).copied().collect(),
            PointMode::SkipFirst => points.iter().skip(1).copied().collect(),
            PointMode::OnlyFirst => points.first().copied().into_iter().collect(),
        }
    }
}

/// Drawing surface driven by a render job. Coordinates are lon/lat; the
/// shifts are extra pixel offsets.
pub trait Renderer {
    fn num_layers(&self) -> usize;

    fn setup_viewport(&mut self, viewport: &DRect);

    fn begin_shape(&mut self, kind: ShapeKind, layer: usize);
    fn add_point(&mut self, x: f64, y: f64, x_shift: f64, y_shift: f64);
    fn end_shape(&mut self);

    fn set_line_color(&mut self, color: Color);
    fn set_fill_color(&mut self, color: Color);
    fn set_line_width(&mut self, width: f64);

    fn clear_layer(&mut self, layer: usize);
    fn clear_output(&mut self);

    /// Composes every layer onto the visible output.
    fn commit(&mut self);

    fn clear_all_layers(&mut self) {
        for layer in 0..self.num_layers() {
            self.clear_layer(layer);
        }
    }

    /// Returns true when the tile's content is already in place, in which
    /// case the caller does not draw it.
    fn start_tile(&mut self, _tile: &Tile, _fingerprint: Fingerprint) -> bool {
        false
    }

    fn end_tile(&mut self, _tile: &Tile, _fingerprint: Fingerprint) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_modes() {
        let points = [1, 2, 3];
        assert_eq!(PointMode::Normal.select(&points), vec![1, 2, 3]);
        assert_eq!(PointMode::RepeatFirst.select(&points), vec![1, 2, 3, 1]);
        assert_eq!(PointMode::SkipFirst.select(&points), vec![2, 3]);
        assert_eq!(PointMode::OnlyFirst.select(&points), vec![1]);
        assert!(PointMode::OnlyFirst.select::<u8>(&[]).is_empty());
    }

    #[test]
    fn color_from_json() {
        let color: Color = serde_json::from_str("\"#ff800040\"").unwrap();
        assert_eq!(color, Color::rgba(0xff, 0x80, 0x00, 0x40));
        assert!(serde_json::from_str::<Color>("\"#ff8000\"").is_err());
        assert!(serde_json::from_str::<Color>("\"#gg800040\"").is_err());
    }
}
