use std::fs::create_dir_all;
use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;
use structured_logger::json::new_writer;
use structured_logger::Builder;

use osm_browser::config::{load_user_config, UserConfig};
use osm_browser::errors::Result;
use osm_browser::etl::draw_map::DrawMapEtl;
use osm_browser::etl::parse_osm::ParseOsmEtl;
use osm_browser::etl::Etl;

/// Renders an OpenStreetMap extract to a PNG image.
#[derive(Parser)]
#[command(name = "osm_browser")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Remove earlier stage outputs before running
    #[arg(long)]
    clean: bool,
}

fn create_output_dir(config: &UserConfig) -> Result<PathBuf> {
    let input_fname = Path::new(&config.data_path)
        .file_name()
        .ok_or("Could not get input file name")?;
    let output_dir = Path::new(&config.dest_path).join(input_fname);
    create_dir_all(&output_dir)?;
    Ok(output_dir)
}

fn setup_logging(level: &str) {
    Builder::with_level(level)
        .with_target_writer("*", new_writer(io::stdout()))
        .init();
}

fn run_etl(etl: &mut impl Etl, dir: &Path, clean: bool) -> Result<()> {
    if clean {
        etl.clean(dir)?;
    }
    etl.process(dir)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let user_config = load_user_config(&cli.config)?;
    setup_logging(&user_config.log_level);

    let output_dir = create_output_dir(&user_config)?;
    let dir_name = output_dir.to_string_lossy();
    info!(output_dir = &*dir_name; "Output directory ready");

    run_etl(&mut ParseOsmEtl::new(&user_config), &output_dir, cli.clean)?;
    let mut draw = DrawMapEtl::new(&user_config);
    run_etl(&mut draw, &output_dir, cli.clean)?;
    let map = draw.output_path(&output_dir);
    let map_name = map.to_string_lossy();
    info!(map = &*map_name; "Map written");
    Ok(())
}
