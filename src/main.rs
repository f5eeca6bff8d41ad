use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tessera::imaging::{self, ScaleFilter};
use tessera::index::ColorIndex;
use tessera::matcher::TileMatchCache;
use tessera::{compose, scanner, store};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(version)]
#[command(about = "Photomosaic generator")]
#[command(long_about = "\
Photomosaic generator

Rebuilds a source image out of small library photos matched by average
color: every pixel of the (downscaled) source becomes one library tile
in the output.

Library fingerprints are cached in a local database keyed by file path,
so only new or changed files are processed on repeat runs. Point --lib
at a directory of jpg/png/gif images, --src at the picture to rebuild,
and --target at a .png or .jpg output path.")]
struct Cli {
    /// Source image to rebuild as a mosaic
    #[arg(long)]
    src: PathBuf,

    /// Output path; the extension (.png, .jpg) selects the encoder
    #[arg(long)]
    target: PathBuf,

    /// Directory of library images to build tiles from
    #[arg(long)]
    lib: PathBuf,

    /// Fingerprint database path
    #[arg(long, default_value = "./tessera.redb")]
    database: PathBuf,

    /// Library name: namespaces fingerprints inside the database
    #[arg(long, default_value = "default")]
    lib_name: String,

    /// Worker threads per parallel phase
    #[arg(long, default_value_t = 12)]
    worker: usize,

    /// Output tile edge in pixels
    #[arg(long, default_value_t = 64)]
    tile_size: u32,

    /// Longest edge the source is downscaled to before composing
    #[arg(long, default_value_t = 128)]
    src_size: u32,

    /// Resampling filter for every rescale
    #[arg(long, value_enum, default_value = "catmull-rom")]
    scale_filter: ScaleFilter,

    /// Re-hash cached library files to catch content changes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    check_hash: bool,

    /// Maximum output size in GB (RGBA, before encoding)
    #[arg(long, default_value_t = 4)]
    max_size: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> tessera::error::Result<()> {
    // Fail on a bad target extension or an oversized output before any
    // scanning happens.
    imaging::output_format(&cli.target)?;
    let source = imaging::load_source(&cli.src, cli.scale_filter, cli.src_size)?;
    imaging::log_color_histogram(&source);
    compose::output_dimensions(source.width(), source.height(), cli.tile_size, cli.max_size)?;

    let store = store::FingerprintStore::open(
        &cli.database,
        &cli.lib_name,
        cli.tile_size,
        cli.scale_filter,
    )?;
    let summary = scanner::scan_library(&store, &cli.lib, cli.worker, cli.check_hash)?;
    log::info!(
        "scan: {} tiles ready ({} new, {} cached, {} skipped, {} evicted)",
        summary.total,
        summary.fingerprinted,
        summary.cached,
        summary.skipped,
        summary.evicted
    );

    let index = Arc::new(ColorIndex::build(store.list_all()?)?);
    index.log_distribution();

    let cache = Arc::new(TileMatchCache::new(
        Arc::clone(&index),
        cli.tile_size,
        cli.scale_filter,
    ));
    let canvas = compose::compose(
        &source,
        cache,
        &compose::ComposeConfig {
            tile_size: cli.tile_size,
            lane_count: cli.worker,
            max_output_gb: cli.max_size,
        },
    )?;

    imaging::encode_output(canvas, &cli.target)?;
    log::info!("wrote {}", cli.target.display());
    Ok(())
}
