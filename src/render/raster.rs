//! Pixel renderer on top of raqote. Every layer is its own draw target;
//! `commit` paints them bottom to top onto the output and then puts back
//! any tiles that came from the tile cache.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use log::debug;
use raqote::{
    BlendMode, DrawOptions, DrawTarget, Image, LineCap, LineJoin, PathBuilder, SolidSource,
    Source, StrokeStyle, Winding,
};

use crate::data::geometry::DRect;
use crate::errors::Result;
use crate::rules::Fingerprint;
use crate::tiles::{Tile, TileId};

use super::cache::{CacheStats, RenderCache};
use super::{Color, Renderer, ShapeKind};

/// Premultiplied ARGB pixels, row major, in raqote's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedImage {
    pub width: i32,
    pub height: i32,
    pub data: Vec<u32>,
}

impl OwnedImage {
    pub fn as_image(&self) -> Image<'_> {
        Image {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[cfg(test)]
    pub fn pixel(&self, x: i32, y: i32) -> u32 {
        self.data[(y * self.width + x) as usize]
    }

    /// Straight alpha RGBA bytes.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() * 4);
        for &argb in &self.data {
            let a = argb >> 24;
            let unpremultiply = |c: u32| {
                if a == 0 { 0 } else { ((c * 255 + a / 2) / a).min(255) as u8 }
            };
            buf.push(unpremultiply((argb >> 16) & 0xff));
            buf.push(unpremultiply((argb >> 8) & 0xff));
            buf.push(unpremultiply(argb & 0xff));
            buf.push(a as u8);
        }
        buf
    }

    pub fn write_png(&self, path: &Path) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        let mut encoder = png::Encoder::new(file, self.width.try_into()?, self.height.try_into()?);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&self.to_rgba())?;
        Ok(())
    }
}

fn solid(color: Color) -> Source<'static> {
    Source::Solid(SolidSource::from_unpremultiplied_argb(color.a, color.r, color.g, color.b))
}

fn stroke(width: f64) -> StrokeStyle {
    StrokeStyle {
        cap: LineCap::Round,
        join: LineJoin::Round,
        width: width as f32,
        miter_limit: 2.0,
        dash_array: Vec::new(),
        dash_offset: 0.0,
    }
}

struct OpenShape {
    kind: ShapeKind,
    layer: usize,
    path: PathBuilder,
    points: usize,
    /// Points of the subpath being built.
    run: usize,
    in_ring: bool,
}

struct CachedBlit {
    tile: TileId,
    key: Fingerprint,
    x: i32,
    y: i32,
}

pub struct RasterRenderer {
    width: i32,
    height: i32,
    background: Color,
    layers: Vec<DrawTarget>,
    output: DrawTarget,
    off_x: f64,
    off_y: f64,
    scale_x: f64,
    scale_y: f64,
    line_color: Color,
    fill_color: Color,
    line_width: f64,
    shape: Option<OpenShape>,
    cache: RenderCache<OwnedImage>,
    blits: Vec<CachedBlit>,
}

impl RasterRenderer {
    pub fn new(width: i32, height: i32, num_layers: usize, cache_capacity: usize) -> RasterRenderer {
        RasterRenderer {
            width,
            height,
            background: Color::gray(0xff),
            layers: (0..num_layers).map(|_| DrawTarget::new(width, height)).collect(),
            output: DrawTarget::new(width, height),
            off_x: 0.0,
            off_y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            line_color: Color::gray(150),
            fill_color: Color::gray(150),
            line_width: 1.0,
            shape: None,
            cache: RenderCache::new(cache_capacity),
            blits: Vec::new(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Copy of the committed output.
    pub fn snapshot(&self) -> OwnedImage {
        OwnedImage {
            width: self.width,
            height: self.height,
            data: self.output.get_data().to_vec(),
        }
    }

    fn to_px(&self, x: f64, y: f64) -> (f32, f32) {
        (
            ((x - self.off_x) * self.scale_x) as f32,
            (self.height as f64 - (y - self.off_y) * self.scale_y) as f32,
        )
    }

    /// Pixel rectangle `(x, y, w, h)` of a tile on the output.
    fn tile_px(&self, tile: &Tile) -> (i32, i32, i32, i32) {
        let (x, y) = self.to_px(tile.rect.x, tile.rect.top());
        (
            x.round() as i32,
            y.round() as i32,
            (tile.rect.w * self.scale_x).round() as i32,
            (tile.rect.h * self.scale_y).round() as i32,
        )
    }

    fn tile_key(&self, fingerprint: &Fingerprint) -> Fingerprint {
        Fingerprint::builder()
            .f64(self.scale_x)
            .f64(self.scale_y)
            .fingerprint(fingerprint)
            .finish()
    }

    fn draw(&mut self, shape: OpenShape) {
        let Some(target) = self.layers.get_mut(shape.layer) else {
            debug!(layer = shape.layer; "Shape on a layer the renderer does not have");
            return;
        };
        let options = DrawOptions::new();
        let line = solid(self.line_color);
        let mut path = shape.path;
        match shape.kind {
            ShapeKind::Line => {
                if shape.points >= 2 {
                    target.stroke(&path.finish(), &line, &stroke(self.line_width), &options);
                }
            },
            ShapeKind::Polygon | ShapeKind::Outer | ShapeKind::Inner | ShapeKind::Multipolygon => {
                if shape.points < 3 {
                    return;
                }
                if shape.kind != ShapeKind::Multipolygon {
                    path.close();
                }
                let mut path = path.finish();
                if shape.kind == ShapeKind::Multipolygon {
                    path.winding = Winding::EvenOdd;
                }
                target.fill(&path, &solid(self.fill_color), &options);
                target.stroke(&path, &line, &stroke(self.line_width), &options);
            },
        }
    }
}

impl Renderer for RasterRenderer {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Fits `viewport` into the output keeping its aspect ratio.
    fn setup_viewport(&mut self, viewport: &DRect) {
        self.off_x = viewport.x;
        self.off_y = viewport.y;
        let sx = if viewport.w > 0.0 { self.width as f64 / viewport.w } else { 1.0 };
        let sy = if viewport.h > 0.0 { self.height as f64 / viewport.h } else { 1.0 };
        let scale = sx.min(sy);
        self.scale_x = scale;
        self.scale_y = scale;
    }

    fn begin_shape(&mut self, kind: ShapeKind, layer: usize) {
        if let Some(open) = &mut self.shape {
            if open.kind == ShapeKind::Multipolygon && matches!(kind, ShapeKind::Outer | ShapeKind::Inner) {
                open.in_ring = true;
                open.run = 0;
                return;
            }
        }
        self.shape = Some(OpenShape {
            kind,
            layer,
            path: PathBuilder::new(),
            points: 0,
            run: 0,
            in_ring: false,
        });
    }

    fn add_point(&mut self, x: f64, y: f64, x_shift: f64, y_shift: f64) {
        let (px, py) = self.to_px(x, y);
        let (px, py) = (px + x_shift as f32, py + y_shift as f32);
        let Some(open) = &mut self.shape else {
            return;
        };
        if open.run == 0 {
            open.path.move_to(px, py);
        } else {
            open.path.line_to(px, py);
        }
        open.run += 1;
        open.points += 1;
    }

    fn end_shape(&mut self) {
        match &mut self.shape {
            Some(open) if open.in_ring => {
                if open.run > 0 {
                    open.path.close();
                }
                open.in_ring = false;
                open.run = 0;
            },
            Some(_) => {
                if let Some(shape) = self.shape.take() {
                    self.draw(shape);
                }
            },
            None => (),
        }
    }

    fn set_line_color(&mut self, color: Color) {
        self.line_color = color;
    }

    fn set_fill_color(&mut self, color: Color) {
        self.fill_color = color;
    }

    fn set_line_width(&mut self, width: f64) {
        self.line_width = width;
    }

    fn clear_layer(&mut self, layer: usize) {
        if let Some(target) = self.layers.get_mut(layer) {
            target.clear(SolidSource::from_unpremultiplied_argb(0, 0, 0, 0));
        }
    }

    fn clear_output(&mut self) {
        let bg = self.background;
        self.output.clear(SolidSource::from_unpremultiplied_argb(bg.a, bg.r, bg.g, bg.b));
        self.blits.clear();
    }

    fn commit(&mut self) {
        let bg = self.background;
        self.output.clear(SolidSource::from_unpremultiplied_argb(bg.a, bg.r, bg.g, bg.b));

        let mut over = DrawOptions::new();
        over.blend_mode = BlendMode::SrcOver;
        for layer in &self.layers {
            let image = Image {
                width: self.width,
                height: self.height,
                data: layer.get_data(),
            };
            self.output.draw_image_at(0.0, 0.0, &image, &over);
        }

        let mut replace = DrawOptions::new();
        replace.blend_mode = BlendMode::Src;
        for blit in &self.blits {
            if let Some(image) = self.cache.peek(blit.tile, blit.key) {
                self.output.draw_image_at(blit.x as f32, blit.y as f32, &image.as_image(), &replace);
            }
        }
    }

    fn start_tile(&mut self, tile: &Tile, fingerprint: Fingerprint) -> bool {
        let key = self.tile_key(&fingerprint);
        if self.cache.get(tile.id, key).is_none() {
            return false;
        }
        let (x, y, _, _) = self.tile_px(tile);
        self.blits.push(CachedBlit { tile: tile.id, key, x, y });
        true
    }

    /// Keeps the tile's part of the output, provided it lies fully inside.
    fn end_tile(&mut self, tile: &Tile, fingerprint: Fingerprint) {
        let (x, y, w, h) = self.tile_px(tile);
        if x < 0 || y < 0 || w <= 0 || h <= 0 || x + w > self.width || y + h > self.height {
            return;
        }
        let source = self.output.get_data();
        let mut data = Vec::with_capacity((w * h) as usize);
        for row in y..y + h {
            let start = (row * self.width + x) as usize;
            data.extend_from_slice(&source[start..start + w as usize]);
        }
        let key = self.tile_key(&fingerprint);
        self.cache.put(tile.id, key, OwnedImage { width: w, height: h, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: u32 = 0xffff_0000;
    const BLUE: u32 = 0xff00_00ff;
    const WHITE: u32 = 0xffff_ffff;

    fn renderer() -> RasterRenderer {
        let mut r = RasterRenderer::new(10, 10, 2, 4);
        r.setup_viewport(&DRect::new(0.0, 0.0, 10.0, 10.0));
        r.clear_output();
        r.clear_all_layers();
        r
    }

    fn square(r: &mut RasterRenderer, kind: ShapeKind, layer: usize, lo: f64, hi: f64) {
        r.begin_shape(kind, layer);
        for (x, y) in [(lo, lo), (hi, lo), (hi, hi), (lo, hi)] {
            r.add_point(x, y, 0.0, 0.0);
        }
        r.end_shape();
    }

    fn paint(r: &mut RasterRenderer, color: Color) {
        r.set_line_color(color);
        r.set_fill_color(color);
    }

    #[test]
    fn polygon_is_filled() {
        let mut r = renderer();
        paint(&mut r, Color::rgba(0xff, 0, 0, 0xff));
        square(&mut r, ShapeKind::Polygon, 0, 2.0, 8.0);
        r.commit();
        let out = r.snapshot();
        assert_eq!(out.pixel(5, 5), RED);
        assert_eq!(out.pixel(0, 0), WHITE);
    }

    #[test]
    fn multipolygon_leaves_holes() {
        let mut r = renderer();
        paint(&mut r, Color::rgba(0, 0, 0xff, 0xff));
        r.begin_shape(ShapeKind::Multipolygon, 1);
        square(&mut r, ShapeKind::Outer, 1, 1.0, 9.0);
        square(&mut r, ShapeKind::Inner, 1, 3.0, 7.0);
        r.end_shape();
        r.commit();
        let out = r.snapshot();
        assert_eq!(out.pixel(2, 5), BLUE);
        assert_eq!(out.pixel(5, 5), WHITE);
    }

    #[test]
    fn higher_layers_cover_lower_ones() {
        let mut r = renderer();
        paint(&mut r, Color::rgba(0, 0, 0xff, 0xff));
        square(&mut r, ShapeKind::Polygon, 1, 2.0, 8.0);
        paint(&mut r, Color::rgba(0xff, 0, 0, 0xff));
        square(&mut r, ShapeKind::Polygon, 0, 2.0, 8.0);
        r.commit();
        assert_eq!(r.snapshot().pixel(5, 5), BLUE);
    }

    #[test]
    fn cached_tile_is_restored_on_commit() {
        let tile = Tile { id: TileId(3), rect: DRect::new(0.0, 0.0, 5.0, 5.0), ways: Vec::new() };
        let style = Fingerprint::builder().byte(1).finish();

        let mut r = renderer();
        assert!(!r.start_tile(&tile, style));
        paint(&mut r, Color::rgba(0xff, 0, 0, 0xff));
        square(&mut r, ShapeKind::Polygon, 0, 0.0, 5.0);
        r.commit();
        r.end_tile(&tile, style);

        r.setup_viewport(&DRect::new(0.0, 0.0, 10.0, 10.0));
        r.clear_output();
        r.clear_all_layers();
        assert!(r.start_tile(&tile, style));
        assert!(!r.start_tile(&tile, Fingerprint::builder().byte(2).finish()));
        r.commit();
        let out = r.snapshot();
        assert_eq!(out.pixel(2, 7), RED);
        assert_eq!(out.pixel(7, 2), WHITE);
        let stats = r.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 2, 1));
    }

    #[test]
    fn png_holds_straight_alpha() {
        let mut r = renderer();
        paint(&mut r, Color::rgba(0xff, 0, 0, 0xff));
        square(&mut r, ShapeKind::Polygon, 0, 2.0, 8.0);
        r.commit();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        r.snapshot().write_png(&path).unwrap();

        let decoder = png::Decoder::new(File::open(&path).unwrap());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (10, 10));
        let at = (5 * 10 + 5) * 4;
        assert_eq!(&buf[at..at + 4], &[0xff, 0, 0, 0xff]);
    }

    #[test]
    fn unpremultiplies_half_alpha() {
        let image = OwnedImage { width: 1, height: 1, data: vec![0x8080_0000] };
        assert_eq!(image.to_rgba(), vec![0xff, 0, 0, 0x80]);
    }
}
