//! Interactive navigation over a dataset.

use std::{str::FromStr, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    cache::ImageCache,
    config::ViewerConfig,
    dataset::{Dataset, Eye, Layout},
    display::{DisplaySurface, PLACEHOLDER_SIZE, Rect, fit_rect},
    error::Error,
    frame::{FramePipeline, FrameSource},
    projection::ProjectionEngine,
    scheduler::{LoadScheduler, LoaderConfig},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerEvent {
    Next,
    Previous,
    Quit,
    Resize { width: u32, height: u32 },
}

impl FromStr for ViewerEvent {
    type Err = String;

    /// Parses `n`, `p`, `q` and `size <w>x<h>`, plus the arrow key names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = s.trim().to_ascii_lowercase();
        match command.as_str() {
            "n" | "next" | "right" => return Ok(Self::Next),
            "p" | "prev" | "previous" | "left" => return Ok(Self::Previous),
            "q" | "quit" | "escape" => return Ok(Self::Quit),
            _ => {}
        }

        command
            .strip_prefix("size")
            .and_then(|size| size.trim().split_once('x'))
            .and_then(|(width, height)| {
                Some((
                    width.trim().parse::<u32>().ok()?,
                    height.trim().parse::<u32>().ok()?,
                ))
            })
            .filter(|(width, height)| *width > 0 && *height > 0)
            .map(|(width, height)| Self::Resize { width, height })
            .ok_or_else(|| format!("unknown command {s:?}"))
    }
}

/// Shows one dataset position at a time, loading entries in the background.
///
/// Every eye with a projection engine of its own camera is rectified before
/// it is cached; the other eyes are shown as decoded.
pub struct Viewer<S: DisplaySurface> {
    scheduler: LoadScheduler<S::Handle>,
    rectified: Vec<Eye>,
    current: usize,
    viewport: (u32, u32),
    running: bool,
}

impl<S> Viewer<S>
where
    S: DisplaySurface,
    S::Handle: 'static,
{
    /// Create a viewer for `dataset`, rectifying each eye listed in
    /// `projections` with its engine. Must be called on the display thread.
    pub fn new(
        dataset: Dataset,
        projections: Vec<(Eye, Arc<ProjectionEngine>)>,
        config: &ViewerConfig,
    ) -> Self {
        let layout = dataset.layout();
        let mut pipeline = FramePipeline::passthrough().with_display_max(config.display_max);
        let mut rectified = Vec::new();
        for (eye, engine) in projections {
            if !layout.eyes().contains(&eye) {
                warn!(?eye, ?layout, "ignoring calibration for a missing eye");
                continue;
            }
            pipeline = pipeline.with_projection(eye, engine);
            rectified.push(eye);
        }

        let viewport = config.window_size(layout);
        let mut viewer = Self::with_source(dataset, Arc::new(pipeline), config.loader(), viewport);
        viewer.rectified = rectified;
        viewer
    }

    /// Create a viewer that loads frames through `source`.
    pub fn with_source(
        dataset: Dataset,
        source: Arc<dyn FrameSource>,
        loader: LoaderConfig,
        viewport: (u32, u32),
    ) -> Self {
        let cache = Arc::new(ImageCache::new(dataset.len(), dataset.layout()));
        Self {
            scheduler: LoadScheduler::new(Arc::new(dataset), cache, source, loader),
            rectified: Vec::new(),
            current: 0,
            viewport,
            running: true,
        }
    }

    /// Load the first entries and start loading the rest in the background.
    pub fn start(&mut self, surface: &mut S) -> Result<(), Error> {
        surface.resize(self.viewport);
        self.scheduler.start(surface)?;
        Ok(())
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether frames of `eye` are rectified.
    pub fn is_rectifying(&self, eye: Eye) -> bool {
        self.rectified.contains(&eye)
    }

    pub fn scheduler(&self) -> &LoadScheduler<S::Handle> {
        &self.scheduler
    }

    pub fn dataset(&self) -> &Dataset {
        self.scheduler.dataset()
    }

    /// Apply a navigation event. Returns whether the viewer is still running.
    pub fn handle_event(&mut self, event: ViewerEvent) -> bool {
        let last = self.dataset().len().saturating_sub(1);
        match event {
            ViewerEvent::Next => self.current = (self.current + 1).min(last),
            ViewerEvent::Previous => self.current = self.current.saturating_sub(1),
            ViewerEvent::Quit => self.running = false,
            ViewerEvent::Resize { width, height } => self.viewport = (width, height),
        }

        debug!(?event, current = self.current, "handled event");
        self.running
    }

    /// One pane per eye, side by side.
    fn panes(&self) -> Vec<Rect> {
        let (width, height) = self.viewport;
        match self.dataset().layout() {
            Layout::Mono => vec![Rect::new(0, 0, width, height)],
            Layout::Stereo => {
                let half = width / 2;
                vec![
                    Rect::new(0, 0, half, height),
                    Rect::new(half, 0, width - half, height),
                ]
            }
        }
    }

    /// Draw the current entry, loading it first if the background workers
    /// have not reached it yet.
    pub fn render(&mut self, surface: &mut S) -> Result<(), Error> {
        if self.dataset().is_empty() {
            surface.clear();
            surface.present()?;
            return Ok(());
        }

        let index = self.current;
        self.scheduler.ensure_loaded(index, surface)?;

        if surface.size() != self.viewport {
            surface.resize(self.viewport);
        }
        surface.clear();

        let layout = self.dataset().layout();
        let panes = self.panes();
        {
            let entry = self.scheduler.cache().get_entry(index)?;
            for (eye, pane) in layout.eyes().iter().zip(&panes) {
                match entry.handle(*eye) {
                    Some(handle) => {
                        let dest = fit_rect(surface.handle_size(handle), *pane);
                        surface.draw(handle, dest)?;
                    }
                    None => surface.draw_placeholder(pane.centred(PLACEHOLDER_SIZE)),
                }
            }
        }
        if layout == Layout::Stereo {
            surface.draw_divider(self.viewport.0 / 2);
        }

        surface.present()?;
        if let Some(entry) = self.dataset().get(index) {
            info!(
                index,
                total = self.dataset().len(),
                name = entry.base_name(),
                claimed = self.scheduler.progress(),
                decoded = self.scheduler.cache().decoded_count(),
                complete = self.scheduler.is_complete(),
                "showing image"
            );
        }
        Ok(())
    }

    /// Block until the background workers have loaded every entry.
    pub fn finish_loading(&mut self) {
        self.scheduler.wait();
    }

    /// Stop the background workers.
    pub fn shutdown(&mut self) {
        self.running = false;
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::DatasetEntry,
        display::SurfaceError,
        frame::{DecodeError, Frame},
    };
    use image::Rgb;
    use rstest::rstest;
    use std::{io, path::{Path, PathBuf}, time::Duration};

    #[derive(Debug, PartialEq)]
    enum Call {
        Draw(u32, Rect),
        Placeholder(Rect),
        Divider(u32),
        Present,
    }

    #[derive(Default)]
    struct RecordingSurface {
        size: (u32, u32),
        calls: Vec<Call>,
        created: u32,
    }

    impl DisplaySurface for RecordingSurface {
        type Handle = (u32, (u32, u32));

        fn create_handle(&mut self, frame: &Frame) -> Result<Self::Handle, SurfaceError> {
            self.created += 1;
            Ok((self.created, frame.dimensions()))
        }

        fn handle_size(&self, handle: &Self::Handle) -> (u32, u32) {
            handle.1
        }

        fn size(&self) -> (u32, u32) {
            self.size
        }

        fn resize(&mut self, size: (u32, u32)) {
            self.size = size;
        }

        fn clear(&mut self) {
            self.calls.clear();
        }

        fn draw(&mut self, handle: &Self::Handle, dest: Rect) -> Result<(), SurfaceError> {
            self.calls.push(Call::Draw(handle.0, dest));
            Ok(())
        }

        fn draw_placeholder(&mut self, dest: Rect) {
            self.calls.push(Call::Placeholder(dest));
        }

        fn draw_divider(&mut self, x: u32) {
            self.calls.push(Call::Divider(x));
        }

        fn present(&mut self) -> Result<(), SurfaceError> {
            self.calls.push(Call::Present);
            Ok(())
        }
    }

    /// Frames are 20x10 unless the path mentions "bad".
    struct StubSource;

    impl FrameSource for StubSource {
        fn load(&self, _eye: Eye, path: &Path) -> Result<Frame, DecodeError> {
            match path.to_string_lossy().contains("bad") {
                true => Err(DecodeError::Open {
                    path: path.to_path_buf(),
                    source: io::Error::other("missing"),
                }),
                false => Ok(Frame::from_pixel(20, 10, Rgb([9, 9, 9]))),
            }
        }
    }

    fn viewer(names: &[&str], layout: Layout) -> Viewer<RecordingSurface> {
        let entries = names
            .iter()
            .map(|name| {
                let paths = layout
                    .eyes()
                    .iter()
                    .map(|eye| PathBuf::from(format!("{name}_{eye:?}.png")))
                    .collect();
                DatasetEntry::new(*name, paths)
            })
            .collect();
        let loader = LoaderConfig {
            initial_load_count: 1,
            num_workers: 1,
            worker_delay: Duration::ZERO,
            ..LoaderConfig::default()
        };
        Viewer::with_source(
            Dataset::from_entries(layout, entries),
            Arc::new(StubSource),
            loader,
            (200, 100),
        )
    }

    #[rstest]
    #[case("n", ViewerEvent::Next)]
    #[case(" Right ", ViewerEvent::Next)]
    #[case("p", ViewerEvent::Previous)]
    #[case("q", ViewerEvent::Quit)]
    #[case("size 640x480", ViewerEvent::Resize { width: 640, height: 480 })]
    fn parses_commands(#[case] input: &str, #[case] expected: ViewerEvent) {
        assert_eq!(input.parse::<ViewerEvent>(), Ok(expected));
    }

    #[rstest]
    #[case("jump")]
    #[case("size 0x10")]
    #[case("size 10")]
    fn rejects_unknown_commands(#[case] input: &str) {
        assert!(input.parse::<ViewerEvent>().is_err());
    }

    #[test]
    fn navigation_is_clamped() {
        let mut viewer = viewer(&["a", "b", "c"], Layout::Mono);
        viewer.handle_event(ViewerEvent::Previous);
        assert_eq!(viewer.current_index(), 0);

        for _ in 0..5 {
            viewer.handle_event(ViewerEvent::Next);
        }
        assert_eq!(viewer.current_index(), 2);

        viewer.handle_event(ViewerEvent::Previous);
        assert_eq!(viewer.current_index(), 1);
    }

    #[test]
    fn quit_and_resize() {
        let mut viewer = viewer(&["a"], Layout::Mono);
        assert!(viewer.handle_event(ViewerEvent::Resize {
            width: 300,
            height: 50
        }));
        assert_eq!(viewer.viewport(), (300, 50));
        assert!(!viewer.handle_event(ViewerEvent::Quit));
        assert!(!viewer.is_running());
    }

    #[test]
    fn renders_mono_entry_fitted_to_viewport() {
        let mut viewer = viewer(&["a", "b"], Layout::Mono);
        let mut surface = RecordingSurface::default();
        viewer.start(&mut surface).unwrap();
        viewer.render(&mut surface).unwrap();

        assert_eq!(
            surface.calls,
            vec![Call::Draw(1, Rect::new(0, 0, 200, 100)), Call::Present]
        );
        assert!(!viewer.is_rectifying(Eye::Left));
        viewer.shutdown();
    }

    #[test]
    fn renders_stereo_panes_with_divider() {
        let mut viewer = viewer(&["a"], Layout::Stereo);
        let mut surface = RecordingSurface::default();
        viewer.start(&mut surface).unwrap();
        viewer.render(&mut surface).unwrap();

        assert_eq!(
            surface.calls,
            vec![
                Call::Draw(1, Rect::new(0, 25, 100, 50)),
                Call::Draw(2, Rect::new(100, 25, 100, 50)),
                Call::Divider(100),
                Call::Present,
            ]
        );
    }

    #[test]
    fn failed_entries_show_placeholder() {
        let mut viewer = viewer(&["a", "bad"], Layout::Mono);
        let mut surface = RecordingSurface::default();
        viewer.start(&mut surface).unwrap();
        viewer.handle_event(ViewerEvent::Next);
        viewer.render(&mut surface).unwrap();

        assert_eq!(
            surface.calls,
            vec![Call::Placeholder(Rect::new(0, 25, 200, 50)), Call::Present]
        );
    }

    #[test]
    fn render_loads_entries_ahead_of_workers() {
        let mut viewer = viewer(&["a", "b", "c", "d"], Layout::Mono);
        let mut surface = RecordingSurface::default();
        viewer.start(&mut surface).unwrap();
        viewer.shutdown();

        for _ in 0..3 {
            viewer.handle_event(ViewerEvent::Next);
        }
        viewer.render(&mut surface).unwrap();
        assert!(viewer.scheduler().cache().is_ready(3, Eye::Left));
        assert!(matches!(surface.calls[0], Call::Draw(_, _)));
    }

    #[test]
    fn resize_changes_surface_on_next_render() {
        let mut viewer = viewer(&["a"], Layout::Mono);
        let mut surface = RecordingSurface::default();
        viewer.start(&mut surface).unwrap();
        assert_eq!(surface.size, (200, 100));

        viewer.handle_event(ViewerEvent::Resize {
            width: 40,
            height: 40,
        });
        viewer.render(&mut surface).unwrap();
        assert_eq!(surface.size, (40, 40));
        assert_eq!(surface.calls[0], Call::Draw(1, Rect::new(0, 10, 40, 20)));
    }
}
