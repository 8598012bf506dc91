use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::data::geometry::DRect;
use crate::data::StoreConfig;
use crate::errors::Result;
use crate::rules::style::StyleConfig;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ViewportConfig {
    pub min_lon: f64,
    pub min_lat: f64,
    pub width: f64,
    pub height: f64,
}

impl From<ViewportConfig> for DRect {
    fn from(value: ViewportConfig) -> Self {
        DRect::new(value.min_lon, value.min_lat, value.width, value.height)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub data_path: String,
    #[serde(default = "UserConfig::default_dest_path")]
    pub dest_path: String,
    #[serde(default = "UserConfig::default_log_level")]
    pub log_level: String,
    #[serde(default = "UserConfig::default_width_px")]
    pub width_px: u32,
    #[serde(default = "UserConfig::default_height_px")]
    pub height_px: u32,
    /// Whole dataset when absent.
    #[serde(default)]
    pub viewport: Option<ViewportConfig>,
    #[serde(default = "UserConfig::default_tile_size")]
    pub tile_width: f64,
    #[serde(default = "UserConfig::default_tile_size")]
    pub tile_height: f64,
    #[serde(default = "UserConfig::default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "UserConfig::default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "UserConfig::default_batch_tiles")]
    pub batch_tiles: usize,
    #[serde(default = "UserConfig::default_skip_attributes")]
    pub skip_attributes: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub style: StyleConfig,
}

impl UserConfig {
    fn default_dest_path() -> String { "output".to_string() }
    fn default_log_level() -> String { "info".to_string() }
    fn default_width_px() -> u32 { 1024 }
    fn default_height_px() -> u32 { 768 }
    fn default_tile_size() -> f64 { 0.01 }
    fn default_num_layers() -> usize { 4 }
    fn default_cache_capacity() -> usize { 100 }
    fn default_batch_tiles() -> usize { 64 }
    fn default_skip_attributes() -> bool { true }

    /// Store settings with the top level attribute switch applied.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig { skip_attributes: self.skip_attributes, ..self.store.clone() }
    }

    fn validate(&self) -> Result<()> {
        if !(self.tile_width > 0.0 && self.tile_height > 0.0) {
            return Err("tile_width and tile_height must be positive".into());
        }
        if self.width_px == 0 || self.height_px == 0 {
            return Err("width_px and height_px must be positive".into());
        }
        if self.num_layers == 0 {
            return Err("num_layers must be at least 1".into());
        }
        let layers = std::iter::once(&self.style.default)
            .chain(self.style.color_rules.iter().map(|c| &c.appearance));
        if let Some(bad) = layers.map(|a| a.layer).find(|&l| l >= self.num_layers) {
            return Err(format!("style layer {} is outside of num_layers {}", bad, self.num_layers).into());
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be at least 1".into());
        }
        let bits = [self.store.node_bits, self.store.way_bits, self.store.relation_bits];
        if bits.iter().any(|b| !(1..=28).contains(b)) {
            return Err("store bucket widths must be between 1 and 28 bits".into());
        }
        Ok(())
    }
}

pub fn parse_user_config(json: &str) -> Result<UserConfig> {
    let config: UserConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

pub fn load_user_config(path: &Path) -> Result<UserConfig> {
    let file = File::open(path)
        .map_err(|err| format!("Could not open config file {}: {}", path.display(), err))?;
    let config: UserConfig = serde_json::from_reader(BufReader::new(file))?;
    config.validate()?;
    Ok(config)
}
