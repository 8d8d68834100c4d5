use clap::Parser;
use fishview::{
    calibration::FisheyeParams,
    config::ViewerConfig,
    dataset::{Dataset, Eye, Layout},
    display::CanvasSurface,
    projection::ProjectionEngine,
    viewer::{Viewer, ViewerEvent},
};
use std::{
    error::Error as _,
    io::{self, BufRead},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use tracing::{Level, info, warn};

/// Browse a mono or stereo fisheye dataset.
///
/// Commands are read from stdin, one per line: `n` (next), `p` (previous),
/// `q` (quit) and `size WxH`. Every rendered view is written to the output
/// image.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// An image directory, or the left and right directories of a stereo
    /// capture.
    #[arg(required = true, num_args = 1..=2)]
    dirs: Vec<PathBuf>,

    /// Fisheye calibration of each camera, left first. Eyes without one are
    /// shown raw.
    #[arg(short, long)]
    calibration: Vec<PathBuf>,

    /// JSON viewer configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "view.png")]
    output: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn report(err: &dyn std::error::Error) -> ExitCode {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    ExitCode::FAILURE
}

/// A missing or malformed calibration only disables rectification for its
/// eye.
fn projections(
    paths: &[PathBuf],
    layout: Layout,
    config: &ViewerConfig,
) -> Vec<(Eye, Arc<ProjectionEngine>)> {
    if paths.len() > layout.eye_count() {
        warn!(given = paths.len(), ?layout, "ignoring extra calibrations");
    } else if !paths.is_empty() && paths.len() < layout.eye_count() {
        warn!(given = paths.len(), ?layout, "showing uncalibrated eyes raw");
    }

    let mut engines = Vec::new();
    for (&eye, path) in layout.eyes().iter().zip(paths) {
        let engine = FisheyeParams::load(path)
            .map_err(fishview::Error::from)
            .and_then(|params| Ok(ProjectionEngine::from_config(params, config)?));

        match engine {
            Ok(engine) => engines.push((eye, Arc::new(engine))),
            Err(err) => warn!(
                ?eye,
                path = %path.display(),
                %err,
                cause = ?err.source().map(ToString::to_string),
                "showing raw frames"
            ),
        }
    }
    engines
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match args.config.as_ref().map(ViewerConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => return report(&err),
    };

    let mut dataset = match Dataset::scan(&args.dirs) {
        Ok(dataset) => dataset,
        Err(err) => return report(&err),
    };

    let stdin = io::stdin();
    let limit = config.dataset_limit(dataset.layout());
    if let Err(err) = dataset.confirm_size(limit, stdin.lock(), io::stderr()) {
        return report(&err);
    }

    let engines = projections(&args.calibration, dataset.layout(), &config);
    let mut viewer = Viewer::new(dataset, engines, &config);
    let mut surface = CanvasSurface::new(viewer.viewport()).with_output(&args.output);

    if let Err(err) = viewer.start(&mut surface) {
        return report(&err);
    }
    if let Err(err) = viewer.render(&mut surface) {
        return report(&err);
    }

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "unable to read command");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match line.parse::<ViewerEvent>() {
            Ok(event) => event,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        if !viewer.handle_event(event) {
            break;
        }
        if let Err(err) = viewer.render(&mut surface) {
            warn!(%err, "render failed");
        }
    }

    viewer.shutdown();
    info!(output = %args.output.display(), "viewer closed");
    ExitCode::SUCCESS
}
