//! Directory scanning and the ordered index of dataset positions.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Extensions accepted by the scanner, in order of preference when one stem
/// has several files.
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{path} is not a valid directory")]
    NotADirectory { path: PathBuf },
    #[error("failed to read directory {path}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no image files found in directory {path}")]
    NoImages { path: PathBuf },
    #[error("no matching stereo pairs found between {left} and {right}")]
    NoMatches { left: PathBuf, right: PathBuf },
    #[error("expected one image directory or a left and right pair, got {count}")]
    DirectoryCount { count: usize },
    #[error("failed to initialize display: {reason}")]
    Display { reason: String },
}

/// One camera of a capture. Mono datasets only use [`Eye::Left`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Mono,
    Stereo,
}

impl Layout {
    /// The eyes present at every position of a dataset with this layout.
    pub fn eyes(self) -> &'static [Eye] {
        match self {
            Layout::Mono => &[Eye::Left],
            Layout::Stereo => &[Eye::Left, Eye::Right],
        }
    }

    pub fn eye_count(self) -> usize {
        self.eyes().len()
    }
}

/// The source files backing one dataset position.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetEntry {
    base_name: String,
    paths: Vec<PathBuf>,
}

impl DatasetEntry {
    pub fn new(base_name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            base_name: base_name.into(),
            paths,
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn path(&self, eye: Eye) -> Option<&Path> {
        self.paths.get(eye.index()).map(PathBuf::as_path)
    }
}

/// Ordered, immutable sequence of dataset positions.
///
/// Positions are sorted by base name, so index `i` always refers to the same
/// files for the lifetime of the dataset.
#[derive(Clone, Debug)]
pub struct Dataset {
    layout: Layout,
    entries: Vec<DatasetEntry>,
}

impl Dataset {
    /// Build a dataset from entries that are already in display order.
    pub fn from_entries(layout: Layout, entries: Vec<DatasetEntry>) -> Self {
        Self { layout, entries }
    }

    /// Scan `dir` for images, one dataset position per file.
    pub fn scan_mono(dir: impl AsRef<Path>) -> Result<Self, SetupError> {
        let dir = dir.as_ref();
        let mut files = image_files(dir)?;
        if files.is_empty() {
            return Err(SetupError::NoImages {
                path: dir.to_path_buf(),
            });
        }

        files.sort();
        let entries: Vec<DatasetEntry> = files
            .into_iter()
            .map(|(stem, path)| DatasetEntry::new(stem, vec![path]))
            .collect();

        info!(count = entries.len(), dir = %dir.display(), "found images");
        Ok(Self::from_entries(Layout::Mono, entries))
    }

    /// Scan both directories and pair files whose stems match.
    pub fn scan_stereo(left: impl AsRef<Path>, right: impl AsRef<Path>) -> Result<Self, SetupError> {
        let (left, right) = (left.as_ref(), right.as_ref());
        let left_files = preferred_by_stem(image_files(left)?);
        let mut right_files = preferred_by_stem(image_files(right)?);

        // BTreeMap iteration keeps the matched stems sorted.
        let entries: Vec<DatasetEntry> = left_files
            .into_iter()
            .filter_map(|(stem, left_path)| {
                let right_path = right_files.remove(&stem)?;
                Some(DatasetEntry::new(stem, vec![left_path, right_path]))
            })
            .collect();

        if entries.is_empty() {
            return Err(SetupError::NoMatches {
                left: left.to_path_buf(),
                right: right.to_path_buf(),
            });
        }

        info!(count = entries.len(), "found matching stereo pairs");
        Ok(Self::from_entries(Layout::Stereo, entries))
    }

    /// Scan one directory as a mono dataset or two as a stereo pair.
    pub fn scan(dirs: &[PathBuf]) -> Result<Self, SetupError> {
        match dirs {
            [dir] => Self::scan_mono(dir),
            [left, right] => Self::scan_stereo(left, right),
            _ => Err(SetupError::DirectoryCount { count: dirs.len() }),
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DatasetEntry> {
        self.entries.get(index)
    }

    pub fn base_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(DatasetEntry::base_name)
    }

    /// Keep only the first `len` positions.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Ask whether a dataset above `limit` positions should be loaded in full.
    ///
    /// Answering `2` keeps only the first `limit` positions, anything else keeps
    /// the whole dataset. Datasets at or under the limit are left untouched
    /// without prompting.
    pub fn confirm_size<R: BufRead, W: Write>(
        &mut self,
        limit: usize,
        mut input: R,
        mut output: W,
    ) -> io::Result<()> {
        if self.len() <= limit {
            return Ok(());
        }

        let noun = match self.layout {
            Layout::Mono => "images",
            Layout::Stereo => "stereo pairs",
        };
        writeln!(output, "Found {} {noun}. This is a large dataset.", self.len())?;
        writeln!(output, "Loading all {noun} may use significant memory and time.")?;
        writeln!(output, "  1. Load all {} {noun}", self.len())?;
        writeln!(output, "  2. Load only the first {limit} {noun}")?;
        write!(output, "Enter your choice (1 or 2): ")?;
        output.flush()?;

        let mut choice = String::new();
        input.read_line(&mut choice)?;
        if choice.trim() == "2" {
            self.truncate(limit);
            writeln!(output, "Limiting to first {limit} {noun}.")?;
        } else {
            writeln!(output, "Loading all {} {noun}.", self.len())?;
        }

        Ok(())
    }
}

/// Returns true if `path` has one of the accepted image extensions, ignoring case.
fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extension_rank(ext).is_some())
        .unwrap_or(false)
}

fn extension_rank(ext: &str) -> Option<usize> {
    let ext = ext.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().position(|candidate| *candidate == ext)
}

/// Non-recursive listing of the image files in `dir` as `(stem, path)` pairs.
fn image_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, SetupError> {
    if !dir.is_dir() {
        return Err(SetupError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    let read_err = |source| SetupError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if !path.is_file() || !has_image_extension(&path) {
            continue;
        }

        match path.file_stem() {
            Some(stem) => files.push((stem.to_string_lossy().into_owned(), path)),
            None => debug!(path = %path.display(), "skipping file without a stem"),
        }
    }

    Ok(files)
}

/// Collapse files sharing a stem onto the one with the preferred extension.
fn preferred_by_stem(files: Vec<(String, PathBuf)>) -> BTreeMap<String, PathBuf> {
    let rank = |path: &Path| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(extension_rank)
            .unwrap_or(usize::MAX)
    };

    let mut by_stem: BTreeMap<String, PathBuf> = BTreeMap::new();
    for (stem, path) in files {
        match by_stem.get(&stem) {
            Some(existing) if rank(existing) <= rank(&path) => {}
            _ => {
                by_stem.insert(stem, path);
            }
        }
    }

    by_stem
}
