use fishview::{
    cache::DecodeState,
    calibration::FisheyeParams,
    config::ViewerConfig,
    dataset::{Dataset, Eye, Layout},
    display::CanvasSurface,
    projection::{CameraModel, LensKind, ProjectionEngine, build_map},
    viewer::{Viewer, ViewerEvent},
};
use image::{Rgb, RgbImage};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn write_image(dir: &Path, name: &str, size: (u32, u32), value: u8) {
    RgbImage::from_pixel(size.0, size.1, Rgb([value, value / 2, 255 - value]))
        .save(dir.join(name))
        .unwrap();
}

fn small_config() -> ViewerConfig {
    ViewerConfig {
        initial_load_count: 3,
        num_workers: 2,
        worker_delay_ms: 1,
        mono_window: (64, 32),
        stereo_window: (64, 32),
        ..ViewerConfig::default()
    }
}

#[test]
fn stereo_dataset_loads_completely() {
    let root = tempfile::tempdir().unwrap();
    let (left, right) = (root.path().join("left"), root.path().join("right"));
    fs::create_dir_all(&left).unwrap();
    fs::create_dir_all(&right).unwrap();
    for i in 0..12u8 {
        write_image(&left, &format!("{i:04}.png"), (8, 4), i * 10);
        write_image(&right, &format!("{i:04}.jpg"), (8, 4), i * 10);
    }
    write_image(&left, "9999.png", (8, 4), 1);
    fs::write(right.join("notes.txt"), "not an image").unwrap();

    let dataset = Dataset::scan_stereo(&left, &right).unwrap();
    assert_eq!(dataset.len(), 12);
    insta::assert_snapshot!(dataset.base_names().take(3).collect::<Vec<_>>().join(","), @"0000,0001,0002");

    let config = small_config();
    let mut viewer = Viewer::new(dataset, Vec::new(), &config);
    let mut surface = CanvasSurface::new(viewer.viewport());
    viewer.start(&mut surface).unwrap();
    viewer.finish_loading();

    let scheduler = viewer.scheduler();
    assert!(scheduler.is_complete());
    assert_eq!(scheduler.progress(), 12);
    for index in 0..12 {
        let entry = scheduler.cache().get_entry(index).unwrap();
        for eye in [Eye::Left, Eye::Right] {
            assert!(entry.state(eye) >= DecodeState::Decoded, "{index} {eye:?}");
        }
    }
}

#[test]
fn navigation_renders_to_canvas() {
    let root = tempfile::tempdir().unwrap();
    for (name, value) in [("b.png", 100), ("a.png", 0), ("c.png", 200)] {
        write_image(root.path(), name, (16, 8), value);
    }
    let output = root.path().join("view.png");

    let dataset = Dataset::scan_mono(root.path()).unwrap();
    assert_eq!(dataset.layout(), Layout::Mono);
    let mut viewer = Viewer::new(dataset, Vec::new(), &small_config());
    let mut surface = CanvasSurface::new(viewer.viewport()).with_output(&output);
    viewer.start(&mut surface).unwrap();

    viewer.handle_event(ViewerEvent::Next);
    viewer.render(&mut surface).unwrap();
    assert_eq!(viewer.current_index(), 1);

    let written = image::open(&output).unwrap().into_rgb8();
    assert_eq!(written.dimensions(), (64, 32));
    assert_eq!(written.get_pixel(32, 16), &Rgb([100, 50, 155]));

    for _ in 0..4 {
        viewer.handle_event(ViewerEvent::Next);
    }
    viewer.render(&mut surface).unwrap();
    assert_eq!(viewer.current_index(), 2);
    assert!(!viewer.handle_event(ViewerEvent::Quit));
    viewer.shutdown();
    assert_eq!(surface.presented(), 2);
}

#[test]
fn corrupt_images_do_not_stop_loading() {
    let root = tempfile::tempdir().unwrap();
    for i in 0..8 {
        write_image(root.path(), &format!("{i}.png"), (4, 4), 9);
    }
    fs::write(root.path().join("5.png"), b"broken").unwrap();

    let dataset = Dataset::scan_mono(root.path()).unwrap();
    let mut viewer = Viewer::new(dataset, Vec::new(), &small_config());
    let mut surface = CanvasSurface::new(viewer.viewport());
    viewer.start(&mut surface).unwrap();
    viewer.finish_loading();

    let cache = viewer.scheduler().cache();
    assert!(cache.is_failed(5, Eye::Left));
    assert!(!cache.is_decoded(5, Eye::Left));
    assert!((6..8).all(|index| cache.is_decoded(index, Eye::Left)));

    for _ in 0..5 {
        viewer.handle_event(ViewerEvent::Next);
    }
    viewer.render(&mut surface).unwrap();
    // Placeholder in the middle of the pane.
    assert_eq!(surface.canvas().get_pixel(32, 16), &Rgb([64, 64, 64]));
}

#[test]
fn calibration_fixture_builds_fisheye_map() {
    let params = FisheyeParams::load(fixture_path("image_02.yaml")).unwrap();
    let map = build_map(&params, (140, 84), 2.5).unwrap();
    assert_eq!(map.dimensions(), (140, 84));
    assert_eq!(map.lens(), LensKind::Equidistant);

    let (x, y) = map.source(70, 42).unwrap();
    assert!((x - 716.943).abs() < 0.01);
    assert!((y - 705.765).abs() < 0.01);
}

#[test]
fn rectified_viewer_uses_engine_output() {
    let root = tempfile::tempdir().unwrap();
    write_image(root.path(), "0000.png", (1400, 1400), 120);

    let config = ViewerConfig {
        output_scale: [0.1, 0.05],
        display_max: 100,
        ..small_config()
    };
    let params = FisheyeParams::load(fixture_path("image_02.yaml")).unwrap();
    let engine = Arc::new(ProjectionEngine::from_config(params, &config).unwrap());
    assert_eq!(engine.output_size(), (140, 70));
    assert_eq!(engine.model(), CameraModel::Fisheye);

    let dataset = Dataset::scan_mono(root.path()).unwrap();
    let mut viewer = Viewer::new(dataset, vec![(Eye::Left, engine)], &config);
    let mut surface = CanvasSurface::new(viewer.viewport());
    viewer.start(&mut surface).unwrap();
    assert!(viewer.is_rectifying(Eye::Left));

    let entry = viewer.scheduler().cache().get_entry(0).unwrap();
    let frame = entry.frame(Eye::Left).unwrap();
    assert_eq!(frame.dimensions(), (100, 50));
    assert_eq!(frame.get_pixel(50, 25), &Rgb([120, 60, 135]));
}

#[test]
fn stereo_eyes_use_their_own_calibration() {
    let root = tempfile::tempdir().unwrap();
    let (left, right) = (root.path().join("left"), root.path().join("right"));
    fs::create_dir_all(&left).unwrap();
    fs::create_dir_all(&right).unwrap();
    let source = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 6, y as u8 * 8, 90]));
    source.save(left.join("0000.png")).unwrap();
    source.save(right.join("0000.png")).unwrap();

    let camera = |name: &str, cx: f64, cy: f64| {
        let params =
            FisheyeParams::new(name, (40, 30), 0.0, [0.0; 4], [20.0, 20.0, cx, cy]).unwrap();
        Arc::new(ProjectionEngine::new(params, (100, 45), 2.5, CameraModel::Fisheye).unwrap())
    };
    let left_engine = camera("image_02", 20.0, 15.0);
    let right_engine = camera("image_03", 10.0, 8.0);

    let dataset = Dataset::scan_stereo(&left, &right).unwrap();
    let mut viewer = Viewer::new(
        dataset,
        vec![
            (Eye::Left, Arc::clone(&left_engine)),
            (Eye::Right, Arc::clone(&right_engine)),
        ],
        &small_config(),
    );
    let mut surface = CanvasSurface::new(viewer.viewport());
    viewer.start(&mut surface).unwrap();
    assert!(viewer.is_rectifying(Eye::Left));
    assert!(viewer.is_rectifying(Eye::Right));

    let entry = viewer.scheduler().cache().get_entry(0).unwrap();
    let (left_frame, right_frame) = (
        entry.frame(Eye::Left).unwrap(),
        entry.frame(Eye::Right).unwrap(),
    );
    assert_eq!(left_frame, &left_engine.apply(&source));
    assert_eq!(right_frame, &right_engine.apply(&source));
    assert_ne!(left_frame, right_frame);
}

#[test]
fn uncalibrated_eye_shows_raw_frames() {
    let root = tempfile::tempdir().unwrap();
    let (left, right) = (root.path().join("left"), root.path().join("right"));
    fs::create_dir_all(&left).unwrap();
    fs::create_dir_all(&right).unwrap();
    write_image(&left, "0000.png", (40, 30), 50);
    write_image(&right, "0000.png", (40, 30), 50);

    let params =
        FisheyeParams::new("image_02", (40, 30), 0.0, [0.0; 4], [20.0, 20.0, 20.0, 15.0]).unwrap();
    let engine =
        Arc::new(ProjectionEngine::new(params, (100, 45), 2.5, CameraModel::Fisheye).unwrap());

    let dataset = Dataset::scan_stereo(&left, &right).unwrap();
    let mut viewer = Viewer::new(dataset, vec![(Eye::Left, engine)], &small_config());
    let mut surface = CanvasSurface::new(viewer.viewport());
    viewer.start(&mut surface).unwrap();
    assert!(!viewer.is_rectifying(Eye::Right));

    let entry = viewer.scheduler().cache().get_entry(0).unwrap();
    assert_eq!(entry.frame(Eye::Left).unwrap().dimensions(), (100, 45));
    assert_eq!(entry.frame(Eye::Right).unwrap().dimensions(), (40, 30));
}
