use clap::Parser;
use fishview::{
    calibration::FisheyeParams,
    config::ViewerConfig,
    frame::{self, Frame},
    projection::{ParamDelta, ProjectionEngine, Tuner, scale_for_display},
};
use image::imageops::{self, FilterType};
use std::{
    error::Error as _,
    io::{self, BufRead},
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{Level, info, warn};

/// Rectify a single fisheye image into a flat panoramic view.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    image: PathBuf,

    #[arg(short, long, default_value = "kitti360_calibration/image_02.yaml")]
    calibration: PathBuf,

    /// JSON viewer configuration, for focal expansion, output scale and
    /// camera model.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "undistorted.png")]
    output: PathBuf,

    /// Also write the rectified image scaled to the display budget.
    #[arg(long)]
    display: Option<PathBuf>,

    /// Also write the original above the rectified image at equal width.
    #[arg(long)]
    comparison: Option<PathBuf>,

    /// Read parameter changes such as `k1 0.02` or `expand 3` from stdin and
    /// write the output again after each one.
    #[arg(long)]
    tune: bool,

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

/// The original on top of the rectified image, both scaled to the wider of
/// the two.
fn comparison(original: &Frame, rectified: &Frame) -> Frame {
    let width = original.width().max(rectified.width());
    let scaled = |frame: &Frame| {
        let height = (frame.height() as u64 * width as u64 / frame.width() as u64).max(1) as u32;
        imageops::resize(frame, width, height, FilterType::Triangle)
    };

    let (top, bottom) = (scaled(original), scaled(rectified));
    let mut canvas = Frame::new(width, top.height() + bottom.height());
    imageops::replace(&mut canvas, &top, 0, 0);
    imageops::replace(&mut canvas, &bottom, 0, top.height() as i64);
    canvas
}

fn save(frame: &Frame, path: &Path) -> Result<(), image::ImageError> {
    frame.save(path)?;
    info!(path = %path.display(), width = frame.width(), height = frame.height(), "wrote image");
    Ok(())
}

fn write_outputs(
    engine: &ProjectionEngine,
    original: &Frame,
    args: &Args,
    config: &ViewerConfig,
) -> Result<(), image::ImageError> {
    let rectified = engine.apply(original);
    save(&rectified, &args.output)?;
    if let Some(path) = &args.display {
        save(&scale_for_display(&rectified, config.display_max), path)?;
    }
    if let Some(path) = &args.comparison {
        save(&comparison(original, &rectified), path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match args.config.as_ref().map(ViewerConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => return report(&err),
    };

    let params = match FisheyeParams::load(&args.calibration) {
        Ok(params) => params,
        Err(err) => return report(&err),
    };
    let original = match frame::decode(&args.image) {
        Ok(frame) => frame,
        Err(err) => return report(&err),
    };
    if original.dimensions() != params.image_size() {
        warn!(
            image = ?original.dimensions(),
            calibration = ?params.image_size(),
            "image size differs from calibration"
        );
    }

    let engine = match ProjectionEngine::from_config(params, &config) {
        Ok(engine) => engine,
        Err(err) => return report(&err),
    };
    if let Err(err) = write_outputs(&engine, &original, &args, &config) {
        return report(&err);
    }
    if !args.tune {
        return ExitCode::SUCCESS;
    }

    let (mut tuner, sender) = Tuner::new(engine);
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => return report(&err),
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ParamDelta>() {
            Ok(delta) => {
                if sender.send(delta).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "ignoring parameter change");
                continue;
            }
        }

        match tuner.poll() {
            Ok(_) => {
                if let Err(err) = write_outputs(tuner.engine(), &original, &args, &config) {
                    return report(&err);
                }
            }
            Err(err) => warn!(%err, "parameters not applied"),
        }
    }

    let engine = tuner.engine();
    info!(
        distortion = ?engine.params().distortion(),
        projection = ?engine.params().projection(),
        focal_expansion = engine.focal_expansion(),
        output_size = ?engine.output_size(),
        "final parameters"
    );
    ExitCode::SUCCESS
}
