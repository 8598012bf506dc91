use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::UserConfig;
use crate::data::binary::read_binary;
use crate::data::geometry::DRect;
use crate::data::tags::TagStore;
use crate::data::OsmData;
use crate::errors::Result;
use crate::render::cache::CacheStats;
use crate::render::raster::{OwnedImage, RasterRenderer};
use crate::render::worker::RenderWorker;
use crate::rules::style::Style;
use crate::rules::Fingerprint;
use crate::tiles::TileIndex;

use super::{parse_osm, remove_if_exists, Etl};

pub const ETL_NAME: &str = "draw_map";

pub struct DrawMapEtl<'a> {
    user_config: &'a UserConfig,
    style: Style,
}

impl DrawMapEtl<'_> {
    /// Rules are parsed up front against an empty tag store and bound to
    /// the real one once the graph is loaded.
    pub fn new(user_config: &UserConfig) -> DrawMapEtl<'_> {
        DrawMapEtl {
            user_config,
            style: Style::from_config(&user_config.style, &TagStore::new()),
        }
    }

    /// Identifies what the output image shows, so that a changed style,
    /// viewport or size never reuses an old image.
    pub fn fingerprint(&self) -> Fingerprint {
        let config = self.user_config;
        let b = Fingerprint::builder()
            .fingerprint(&self.style.fingerprint())
            .bytes(&config.width_px.to_le_bytes())
            .bytes(&config.height_px.to_le_bytes())
            .bytes(&(config.num_layers as u64).to_le_bytes());
        let b = match config.viewport {
            Some(v) => b.byte(1).f64(v.min_lon).f64(v.min_lat).f64(v.width).f64(v.height),
            None => b.byte(0),
        };
        b.finish()
    }

    pub fn output_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("map-{}.png", self.fingerprint().short()))
    }

    fn viewport(&self, data: &OsmData) -> Result<DRect> {
        let viewport = match self.user_config.viewport {
            Some(viewport) => viewport.into(),
            None => data.bounds(),
        };
        if viewport.is_empty() {
            return Err("Nothing to draw: viewport is empty".into());
        }
        Ok(viewport)
    }
}

impl Etl for DrawMapEtl<'_> {
    type Input = OsmData;
    type Output = OwnedImage;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn is_cached(&self, dir: &Path) -> Result<bool> {
        Ok(self.output_path(dir).try_exists()?)
    }

    fn clean(&self, dir: &Path) -> Result<()> {
        remove_if_exists(&self.output_path(dir))
    }

    fn extract(&mut self, dir: &Path) -> Result<Self::Input> {
        let input_path = parse_osm::output_path(&self.user_config.data_path, dir);
        let mut input = BufReader::new(File::open(&input_path)?);
        let mut data = read_binary(&mut input, self.user_config.store_config())?;
        data.resolve();
        Ok(data)
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        let config = self.user_config;
        let viewport = self.viewport(&input)?;

        let mut tiles = TileIndex::new(&input.bounds(), config.tile_width, config.tile_height)?;
        tiles.assign_ways(&input);
        info!(
            tiles = tiles.len(),
            x_num = tiles.x_num(),
            y_num = tiles.y_num();
            "Tile index built"
        );

        let mut style = self.style.clone();
        style.bind(&input.tags);

        let width: i32 = config.width_px.try_into()?;
        let height: i32 = config.height_px.try_into()?;
        let (num_layers, cache_capacity) = (config.num_layers, config.cache_capacity);
        let worker = RenderWorker::spawn(
            Arc::new(input),
            Arc::new(tiles),
            Arc::new(style),
            Some(config.batch_tiles).filter(|&n| n > 0),
            move || RasterRenderer::new(width, height, num_layers, cache_capacity),
            |renderer: &RasterRenderer| (renderer.snapshot(), renderer.cache_stats()),
        )?;
        worker.request_render(viewport)?;
        let frame = worker.wait().ok_or("Render worker stopped before the map was drawn")?;
        worker.shutdown();

        let (image, cache): (OwnedImage, CacheStats) = frame.image;
        info!(
            tiles_drawn = frame.stats.tiles_drawn,
            tiles_cached = frame.stats.tiles_cached,
            ways_drawn = frame.stats.ways_drawn,
            relations_drawn = frame.stats.relations_drawn,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            cache_evictions = cache.evictions;
            "Map drawn"
        );
        Ok(image)
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        output.write_png(&self.output_path(dir))
    }
}
