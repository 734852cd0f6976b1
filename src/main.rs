use clap::{Parser, Subcommand};
use picture_forge::catalog::VariantCatalog;
use picture_forge::config::{self, TranscodeConfig};
use picture_forge::imaging::Format;
use picture_forge::output;
use picture_forge::orchestrator::Transcoder;
use picture_forge::registry::DriverRegistry;
use picture_forge::source::{self, SourceImage};
use picture_forge::storage::{IndexedRepository, LocalStorage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "picture-forge")]
#[command(about = "Transcode images through ImageMagick or the built-in encoders")]
#[command(long_about = "\
Transcode images through ImageMagick or the built-in encoders

Drivers are probed once at startup and tried in priority order. When one
fails, the next is tried; when none can produce the requested format, the
format fallback chain is followed (avif → webp → jpeg by default). Sources
whose dimensions exceed the configured or live limits are rejected before
any encoder runs.

Store layout written by 'materialize':

  store/
  ├── .variant-index.json          # One row per (source, variant, format)
  └── dawn.jpg/                    # Source path relative to its input
      ├── thumbnail.webp
      ├── thumbnail.jpg
      └── full.webp

Logs go to stderr; set RUST_LOG (e.g. RUST_LOG=picture_forge=debug) for
more detail. Run 'picture-forge gen-config' for a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Config file overlaid on the stock defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe drivers and list what each can produce
    Drivers,
    /// Show dimensions, orientation and per-driver admission of images
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Produce one variant of one image
    Transcode {
        input: PathBuf,
        /// Variant name from the config
        #[arg(long, default_value = "full")]
        variant: String,
        /// Requested output format
        #[arg(long, default_value = "webp")]
        format: Format,
        /// Output file; defaults to <stem>-<variant>.<ext> next to the input
        #[arg(long = "output", short)]
        out: Option<PathBuf>,
    },
    /// Generate every missing variant of images into a store directory
    Materialize {
        /// Image files or directories to walk
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Store root
        #[arg(long, default_value = "variants")]
        store: PathBuf,
        /// Encode the pairs of each image in parallel
        #[arg(long)]
        parallel: bool,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = config::load_config(cli.config.as_deref())?;
    init_thread_pool(&config.processing);
    let registry = Arc::new(DriverRegistry::from_config(&config)?);

    match cli.command {
        Command::Drivers => {
            // Probe failures still leave the descriptors to display
            if let Err(e) = registry.detect() {
                debug!(error = %e, "no driver detected");
            }
            output::print_drivers(&registry.descriptors());
        }
        Command::Probe { files } => {
            registry.detect()?;
            let transcoder = Transcoder::from_config(Arc::clone(&registry), &config);
            for file in &files {
                probe(&transcoder, &config, file)?;
            }
        }
        Command::Transcode {
            input,
            variant,
            format,
            out,
        } => {
            let spec = config
                .variants
                .iter()
                .find(|v| v.name == variant)
                .ok_or_else(|| format!("unknown variant '{variant}'"))?;
            let transcoder = Transcoder::from_config(Arc::clone(&registry), &config);
            let source = SourceImage::from_path(&input)?;
            let image = match transcoder.transcode(&source, spec, format, &config.limits) {
                Ok(image) => image,
                Err(failure) => {
                    for line in output::format_failure(&failure) {
                        eprintln!("{}", line);
                    }
                    return Err(failure.into());
                }
            };
            let path = out.unwrap_or_else(|| default_output(&input, &variant, image.format));
            std::fs::write(&path, &image.bytes)?;
            output::print_transcode(&image, &path);
            output::print_fallback_summary(transcoder.fallback_counter());
        }
        Command::Materialize {
            inputs,
            store,
            parallel,
        } => {
            let transcoder = Arc::new(Transcoder::from_config(Arc::clone(&registry), &config));
            let catalog = VariantCatalog::from_config(
                Arc::clone(&transcoder),
                Arc::new(LocalStorage::new(&store)),
                Arc::new(IndexedRepository::open(&store)),
                &config,
            );
            for file in source::collect_sources(&inputs, Some(store.as_path())) {
                let source = SourceImage::from_file(&file)?;
                let report = if parallel {
                    catalog.materialize_parallel(&source)?
                } else {
                    catalog.materialize(&source)?
                };
                output::print_materialize_report(&report);
            }
            output::print_fallback_summary(transcoder.fallback_counter());
        }
        Command::GenConfig => {}
    }

    Ok(())
}

fn probe(
    transcoder: &Transcoder,
    config: &TranscodeConfig,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = SourceImage::from_path(file)?;
    let analyzer = transcoder.analyzer();
    let registry = transcoder.registry();
    let dimensions = source
        .dimensions_with(analyzer)
        .map_err(|e| e.to_string());
    let orientation = dimensions
        .as_ref()
        .ok()
        .and_then(|dims| analyzer.orientation(*dims));
    let mut admissions = Vec::new();
    if let Ok(dims) = dimensions {
        for &id in registry.detect()? {
            if let Some(driver) = registry.driver(id) {
                let verdict = transcoder
                    .guard()
                    .check_dimensions(dims, driver, &config.limits);
                admissions.push((id, verdict));
            }
        }
    }
    output::print_probe(&source, dimensions, orientation, &admissions);
    Ok(())
}

fn default_output(input: &Path, variant: &str, format: Format) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}-{variant}.{}", format.extension()))
}

/// Stderr logging, filtered by `RUST_LOG` (default `picture_forge=info`).
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("picture_forge=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; the user can constrain down,
/// not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
