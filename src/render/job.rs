//! One incremental pass over the tiles of a viewport.
//!
//! The pass walks layers in the outer loop and the visible tiles in the
//! inner one. Within a layer a way is drawn by the first tile that holds
//! it: once any tile of its span has been rendered the way is skipped.
//! Relations are reached through the back links of their member ways and
//! are drawn at most once per layer.
//!
//! [`RenderJob::run`] can stop after a batch of tiles or when asked to
//! cancel, and picks up at the same tile and layer on the next call.

use std::collections::HashSet;

use log::{debug, info};

use crate::data::geometry::DRect;
use crate::data::osm::{NodeIdx, RelIdx, WayIdx};
use crate::data::OsmData;
use crate::rules::style::{Appearance, Style};
use crate::tiles::{TileId, TileIndex};

use super::assembler::Assembly;
use super::{Renderer, ShapeKind};

/// Everything a pass reads. None of it changes while a pass is running.
#[derive(Clone, Copy)]
pub struct RenderContext<'a> {
    pub data: &'a OsmData,
    pub tiles: &'a TileIndex,
    pub style: &'a Style,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Complete,
    /// The batch ran out; call `run` again to continue.
    Incomplete,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub tiles_drawn: usize,
    pub tiles_cached: usize,
    pub ways_drawn: usize,
    pub relations_drawn: usize,
}

#[derive(Debug)]
pub struct RenderJob {
    viewport: DRect,
    visible: Vec<TileId>,
    cached: HashSet<TileId>,
    cursor: usize,
    layer: usize,
    rendered: HashSet<TileId>,
    rendered_relations: HashSet<RelIdx>,
    started: bool,
    finished: bool,
    stats: JobStats,
}

impl RenderJob {
    pub fn new(viewport: DRect) -> RenderJob {
        RenderJob {
            viewport,
            visible: Vec::new(),
            cached: HashSet::new(),
            cursor: 0,
            layer: 0,
            rendered: HashSet::new(),
            rendered_relations: HashSet::new(),
            started: false,
            finished: false,
            stats: JobStats::default(),
        }
    }

    /// Drops all progress. The next `run` queries the visible tiles again.
    pub fn restart(&mut self, viewport: DRect) {
        *self = RenderJob::new(viewport);
    }

    pub fn viewport(&self) -> &DRect {
        &self.viewport
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> JobStats {
        self.stats
    }

    #[cfg(test)]
    pub fn visible_tiles(&self) -> &[TileId] {
        &self.visible
    }

    fn start(&mut self, ctx: &RenderContext, renderer: &mut dyn Renderer) {
        let viewport = self.viewport;
        self.visible = ctx.tiles.query_rect(&viewport)
            .into_iter()
            .filter(|&t| ctx.tiles.tile(t).rect.overlaps(&viewport))
            .collect();

        renderer.setup_viewport(&viewport);
        renderer.clear_output();
        renderer.clear_all_layers();

        let fingerprint = ctx.style.fingerprint();
        for &id in &self.visible {
            if renderer.start_tile(ctx.tiles.tile(id), fingerprint) {
                self.cached.insert(id);
            }
        }
        self.stats.tiles_cached = self.cached.len();
        self.started = true;
        let style = fingerprint.short();
        info!(
            tiles = self.visible.len(),
            cached = self.cached.len(),
            style = style.as_str();
            "Render pass started"
        );
    }

    fn progress(&self, num_layers: usize) -> f64 {
        let total = self.visible.len() * num_layers;
        if total == 0 {
            return 1.0;
        }
        (self.layer * self.visible.len() + self.cursor) as f64 / total as f64
    }

    /// Renders up to `max_tiles` tiles (every remaining one for `None`).
    /// `must_cancel` is polled with the pass progress in `[0, 1]` after each
    /// tile; a cancelled job keeps its position and can still be resumed.
    pub fn run(
        &mut self,
        ctx: &RenderContext,
        renderer: &mut dyn Renderer,
        max_tiles: Option<usize>,
        mut must_cancel: impl FnMut(f64) -> bool,
    ) -> RenderStatus {
        if self.finished {
            return RenderStatus::Complete;
        }
        if !self.started {
            self.start(ctx, renderer);
        }

        let num_layers = renderer.num_layers();
        let mut budget = max_tiles;
        while self.layer < num_layers {
            while self.cursor < self.visible.len() {
                if budget == Some(0) {
                    renderer.commit();
                    return RenderStatus::Incomplete;
                }
                let id = self.visible[self.cursor];
                if !self.cached.contains(&id) {
                    self.render_tile(ctx, renderer, id);
                    self.rendered.insert(id);
                }
                self.cursor += 1;
                if let Some(left) = budget.as_mut() {
                    *left -= 1;
                }
                if must_cancel(self.progress(num_layers)) {
                    debug!(layer = self.layer, cursor = self.cursor; "Render pass cancelled");
                    return RenderStatus::Cancelled;
                }
            }
            self.layer += 1;
            self.cursor = 0;
            self.rendered.clear();
            self.rendered_relations.clear();
        }

        renderer.commit();
        let fingerprint = ctx.style.fingerprint();
        for &id in &self.visible {
            if !self.cached.contains(&id) {
                renderer.end_tile(ctx.tiles.tile(id), fingerprint);
            }
        }
        self.stats.tiles_drawn = self.visible.len() - self.cached.len();
        self.finished = true;
        info!(
            tiles_drawn = self.stats.tiles_drawn,
            tiles_cached = self.stats.tiles_cached,
            ways = self.stats.ways_drawn,
            relations = self.stats.relations_drawn;
            "Render pass finished"
        );
        RenderStatus::Complete
    }

    fn render_tile(&mut self, ctx: &RenderContext, renderer: &mut dyn Renderer, id: TileId) {
        for tile_way in &ctx.tiles.tile(id).ways {
            if tile_way.span.iter().any(|t| self.rendered.contains(t)) {
                continue;
            }
            self.render_way(ctx, renderer, tile_way.way);
            for &rel in ctx.data.relations_of_way(tile_way.way) {
                if self.rendered_relations.insert(rel) {
                    self.render_relation(ctx, renderer, rel);
                }
            }
        }
    }

    fn render_way(&mut self, ctx: &RenderContext, renderer: &mut dyn Renderer, idx: WayIdx) {
        let way = ctx.data.way(idx);
        let Some(appearance) = ctx.style.appearance(&way.element) else {
            return;
        };
        if appearance.layer != self.layer {
            return;
        }
        apply(renderer, &appearance);
        let nodes = way.nodes.resolved();
        if appearance.polygon {
            draw_polygon(ctx.data, renderer, nodes, self.layer);
        } else {
            draw_line(ctx.data, renderer, nodes, self.layer);
        }
        self.stats.ways_drawn += 1;
    }

    fn render_relation(&mut self, ctx: &RenderContext, renderer: &mut dyn Renderer, idx: RelIdx) {
        let relation = ctx.data.relation(idx);
        let Some(appearance) = ctx.style.appearance(&relation.element) else {
            return;
        };
        if appearance.layer != self.layer {
            return;
        }
        apply(renderer, &appearance);
        if appearance.polygon {
            let assembly = Assembly::of_relation(ctx.data, relation);
            if assembly.is_empty() {
                return;
            }
            assembly.render(ctx.data, renderer, self.layer);
        } else {
            for way in relation.members().filter_map(|(way, _)| way) {
                draw_line(ctx.data, renderer, ctx.data.way(way).nodes.resolved(), self.layer);
            }
        }
        self.stats.relations_drawn += 1;
    }
}

fn apply(renderer: &mut dyn Renderer, appearance: &Appearance) {
    renderer.set_line_color(appearance.line_color);
    renderer.set_fill_color(appearance.fill_color);
    renderer.set_line_width(appearance.line_width);
}

/// A hole ends the current line and starts a new one.
fn draw_line(data: &OsmData, renderer: &mut dyn Renderer, nodes: &[Option<NodeIdx>], layer: usize) {
    renderer.begin_shape(ShapeKind::Line, layer);
    for slot in nodes {
        match slot {
            Some(n) => {
                let node = data.node(*n);
                renderer.add_point(node.lon(), node.lat(), 0.0, 0.0);
            },
            None => {
                renderer.end_shape();
                renderer.begin_shape(ShapeKind::Line, layer);
            },
        }
    }
    renderer.end_shape();
}

fn draw_polygon(data: &OsmData, renderer: &mut dyn Renderer, nodes: &[Option<NodeIdx>], layer: usize) {
    renderer.begin_shape(ShapeKind::Polygon, layer);
    for &n in nodes.iter().flatten() {
        let node = data.node(n);
        renderer.add_point(node.lon(), node.lat(), 0.0, 0.0);
    }
    renderer.end_shape();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::sample;
    use crate::render::recording::{Event, RecordingRenderer};
    use crate::rules::style::StyleConfig;

    struct Fixture {
        data: OsmData,
        tiles: TileIndex,
        style: Style,
    }

    fn fixture(style_json: &str) -> Fixture {
        let mut data = sample();
        data.resolve();
        let mut tiles = TileIndex::new(&data.bounds(), 0.5, 0.5).unwrap();
        tiles.assign_ways(&data);
        let config: StyleConfig = serde_json::from_str(style_json).unwrap();
        let style = Style::from_config(&config, &data.tags);
        Fixture { data, tiles, style }
    }

    const FOREST: &str = r#"{
        "color_rules": [ { "rule": "(tag 'landuse' 'forest')", "polygon": true, "layer": 0 } ]
    }"#;

    impl Fixture {
        fn ctx(&self) -> RenderContext<'_> {
            RenderContext { data: &self.data, tiles: &self.tiles, style: &self.style }
        }

        fn render_all(&self, renderer: &mut RecordingRenderer) -> RenderJob {
            let mut job = RenderJob::new(self.data.bounds());
            let status = job.run(&self.ctx(), renderer, None, |_| false);
            assert_eq!(status, RenderStatus::Complete);
            job
        }
    }

    fn drawing(events: &[Event]) -> Vec<Event> {
        events.iter().filter(|e| **e != Event::Commit).cloned().collect()
    }

    #[test]
    fn every_feature_is_drawn_once_per_pass() {
        let f = fixture(FOREST);
        let mut renderer = RecordingRenderer::new(3);
        let job = f.render_all(&mut renderer);

        assert_eq!(job.visible_tiles().len(), 4);
        let shapes = renderer.shapes();
        let count = |kind, layer| shapes.iter().filter(|&&s| s == (kind, layer)).count();
        assert_eq!(count(ShapeKind::Multipolygon, 0), 1);
        assert_eq!(count(ShapeKind::Outer, 0), 1);
        // the closed way plus the track split at its hole
        assert_eq!(count(ShapeKind::Line, 1), 3);
        assert_eq!(shapes.len(), 5);
        assert_eq!(job.stats().ways_drawn, 2);
        assert_eq!(job.stats().relations_drawn, 1);
    }

    #[test]
    fn pass_frames_drawing_with_setup_and_commit() {
        let f = fixture(FOREST);
        let mut renderer = RecordingRenderer::new(2);
        f.render_all(&mut renderer);

        let events = &renderer.events;
        assert!(matches!(events[0], Event::Viewport(_)));
        assert_eq!(events[1], Event::ClearOutput);
        assert_eq!(events[2], Event::ClearLayer(0));
        assert_eq!(events[3], Event::ClearLayer(1));
        assert!(matches!(events[4], Event::StartTile(_)));
        let commit = events.iter().position(|e| *e == Event::Commit).unwrap();
        let ends = events[commit + 1..].iter().filter(|e| matches!(e, Event::EndTile(_))).count();
        assert_eq!(ends, 4);
    }

    #[test]
    fn batches_resume_where_they_stopped() {
        let f = fixture(FOREST);
        let mut whole = RecordingRenderer::new(3);
        f.render_all(&mut whole);

        let mut batched = RecordingRenderer::new(3);
        let mut job = RenderJob::new(f.data.bounds());
        let mut rounds = 0;
        while job.run(&f.ctx(), &mut batched, Some(1), |_| false) != RenderStatus::Complete {
            rounds += 1;
        }
        assert_eq!(rounds, 11);
        assert_eq!(drawing(&batched.events), drawing(&whole.events));
    }

    #[test]
    fn cancelled_job_can_be_resumed() {
        let f = fixture(FOREST);
        let mut whole = RecordingRenderer::new(3);
        f.render_all(&mut whole);

        let mut renderer = RecordingRenderer::new(3);
        let mut job = RenderJob::new(f.data.bounds());
        let mut seen = Vec::new();
        let status = job.run(&f.ctx(), &mut renderer, None, |p| {
            seen.push(p);
            p >= 0.5
        });
        assert_eq!(status, RenderStatus::Cancelled);
        assert!(!job.is_finished());
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(job.run(&f.ctx(), &mut renderer, None, |_| false), RenderStatus::Complete);
        assert_eq!(drawing(&renderer.events), drawing(&whole.events));
    }

    #[test]
    fn cached_tiles_are_not_redrawn() {
        let f = fixture(FOREST);
        let mut renderer = RecordingRenderer::new(3);
        for tile in f.tiles.tiles() {
            renderer.cached.insert(tile.id);
        }
        let job = f.render_all(&mut renderer);
        assert!(renderer.shapes().is_empty());
        assert!(!renderer.events.iter().any(|e| matches!(e, Event::EndTile(_))));
        assert_eq!(job.stats().tiles_cached, 4);
        assert_eq!(renderer.events.last(), Some(&Event::Commit));
    }

    #[test]
    fn draw_rule_hides_relations() {
        let f = fixture(r#"{
            "draw_rule": "(not (type 'relation'))",
            "color_rules": [ { "rule": "(tag 'landuse')", "polygon": true, "layer": 0 } ]
        }"#);
        let mut renderer = RecordingRenderer::new(3);
        f.render_all(&mut renderer);
        assert!(!renderer.shapes().iter().any(|(kind, _)| *kind == ShapeKind::Multipolygon));
        assert_eq!(renderer.shapes().len(), 3);
    }

    #[test]
    fn restart_starts_over() {
        let f = fixture(FOREST);
        let mut renderer = RecordingRenderer::new(3);
        let mut job = f.render_all(&mut renderer);
        assert_eq!(job.run(&f.ctx(), &mut renderer, None, |_| false), RenderStatus::Complete);

        renderer.events.clear();
        job.restart(DRect::new(0.6, 0.6, 0.1, 0.1));
        assert!(!job.is_finished());
        assert_eq!(job.run(&f.ctx(), &mut renderer, None, |_| false), RenderStatus::Complete);
        assert_eq!(job.visible_tiles().len(), 1);
        assert!(matches!(renderer.events[0], Event::Viewport(_)));
    }
}
