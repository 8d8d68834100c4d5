//! Decoded frames and renderable handles for every dataset position.
//!
//! All frame and handle storage sits behind one mutex. Each slot (one per
//! eye of every entry) also carries atomic flags so that readiness can be
//! checked without taking the lock. Flags are only ever set while the lock is
//! held, so a slot moves `Empty -> Decoded -> Ready` and never back.

use std::{
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    dataset::{Eye, Layout},
    display::{DisplaySurface, SurfaceError},
    frame::Frame,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("index {index} is out of range for a cache of {len} entries")]
    OutOfRange { index: usize, len: usize },
    #[error("{eye:?} eye is not part of a {layout:?} dataset")]
    MissingEye { eye: Eye, layout: Layout },
    #[error("renderables can only be created on the display thread")]
    NotPrivileged,
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodeState {
    Empty,
    Decoded,
    Ready,
}

struct Slot<H> {
    frame: Option<Frame>,
    handle: Option<H>,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Self {
            frame: None,
            handle: None,
        }
    }
}

impl<H> Slot<H> {
    fn state(&self) -> DecodeState {
        match (&self.frame, &self.handle) {
            (_, Some(_)) => DecodeState::Ready,
            (Some(_), None) => DecodeState::Decoded,
            (None, None) => DecodeState::Empty,
        }
    }
}

#[derive(Default)]
struct SlotFlags {
    decoded: AtomicBool,
    ready: AtomicBool,
    failed: AtomicBool,
}

/// Storage for the decode and render state of a fixed number of entries.
pub struct ImageCache<H> {
    layout: Layout,
    len: usize,
    slots: Mutex<Vec<Slot<H>>>,
    flags: Vec<SlotFlags>,
    owner: ThreadId,
}

impl<H> ImageCache<H> {
    /// Create an empty cache of `len` entries.
    ///
    /// The calling thread becomes the only thread allowed to promote entries.
    pub fn new(len: usize, layout: Layout) -> Self {
        let count = len * layout.eye_count();
        Self {
            layout,
            len,
            slots: Mutex::new((0..count).map(|_| Slot::default()).collect()),
            flags: (0..count).map(|_| SlotFlags::default()).collect(),
            owner: thread::current().id(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    fn slot_index(&self, index: usize, eye: Eye) -> Result<usize, CacheError> {
        if index >= self.len {
            return Err(CacheError::OutOfRange {
                index,
                len: self.len,
            });
        }
        if !self.layout.eyes().contains(&eye) {
            return Err(CacheError::MissingEye {
                eye,
                layout: self.layout,
            });
        }
        Ok(index * self.layout.eye_count() + eye.index())
    }

    fn flags(&self, index: usize, eye: Eye) -> Option<&SlotFlags> {
        self.slot_index(index, eye)
            .ok()
            .map(|slot| &self.flags[slot])
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot<H>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow entry `index` for as long as the returned view is alive.
    ///
    /// The cache lock is held by the view, so keep it short-lived.
    pub fn get_entry(&self, index: usize) -> Result<EntryView<'_, H>, CacheError> {
        self.slot_index(index, Eye::Left)?;
        Ok(EntryView {
            slots: self.lock(),
            first: index * self.layout.eye_count(),
            layout: self.layout,
        })
    }

    /// Install a decoded frame, replacing any earlier one.
    ///
    /// Ignored once the slot is ready.
    pub fn store_decoded(&self, index: usize, eye: Eye, frame: Frame) -> Result<(), CacheError> {
        let slot = self.slot_index(index, eye)?;
        let mut slots = self.lock();
        if slots[slot].handle.is_some() {
            debug!(index, ?eye, "entry already ready, dropping decoded frame");
            return Ok(());
        }

        slots[slot].frame = Some(frame);
        self.flags[slot].decoded.store(true, Ordering::Release);
        trace!(index, ?eye, "stored decoded frame");
        Ok(())
    }

    /// Create the renderable for a decoded slot.
    ///
    /// Returns `Ok(false)` if the slot is already ready or not decoded yet.
    /// Fails with [`CacheError::NotPrivileged`] off the thread that created
    /// the cache.
    pub fn promote_to_ready<S>(
        &self,
        index: usize,
        eye: Eye,
        surface: &mut S,
    ) -> Result<bool, CacheError>
    where
        S: DisplaySurface<Handle = H>,
    {
        if thread::current().id() != self.owner {
            return Err(CacheError::NotPrivileged);
        }

        let slot = self.slot_index(index, eye)?;
        let mut slots = self.lock();
        let entry = &mut slots[slot];
        let handle = match (&entry.frame, &entry.handle) {
            (Some(frame), None) => surface.create_handle(frame)?,
            _ => return Ok(false),
        };

        entry.handle = Some(handle);
        self.flags[slot].ready.store(true, Ordering::Release);
        trace!(index, ?eye, "promoted entry");
        Ok(true)
    }

    /// Lock-free check. `false` for positions outside the cache.
    pub fn is_ready(&self, index: usize, eye: Eye) -> bool {
        self.flags(index, eye)
            .is_some_and(|flags| flags.ready.load(Ordering::Acquire))
    }

    /// Lock-free check, also `true` once the slot is ready.
    pub fn is_decoded(&self, index: usize, eye: Eye) -> bool {
        self.flags(index, eye)
            .is_some_and(|flags| flags.decoded.load(Ordering::Acquire))
    }

    /// Whether every eye of entry `index` is ready.
    pub fn is_entry_ready(&self, index: usize) -> bool {
        self.layout
            .eyes()
            .iter()
            .all(|eye| self.is_ready(index, *eye))
    }

    /// Record that decoding the slot failed.
    ///
    /// Returns `true` the first time, so the failure can be reported once.
    pub fn mark_failed(&self, index: usize, eye: Eye) -> bool {
        self.flags(index, eye)
            .is_some_and(|flags| !flags.failed.swap(true, Ordering::AcqRel))
    }

    pub fn is_failed(&self, index: usize, eye: Eye) -> bool {
        self.flags(index, eye)
            .is_some_and(|flags| flags.failed.load(Ordering::Acquire))
    }

    /// Number of slots that hold at least a decoded frame.
    pub fn decoded_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|flags| flags.decoded.load(Ordering::Acquire))
            .count()
    }
}

/// A borrowed view of one cache entry, holding the cache lock.
pub struct EntryView<'a, H> {
    slots: MutexGuard<'a, Vec<Slot<H>>>,
    first: usize,
    layout: Layout,
}

impl<H> EntryView<'_, H> {
    fn slot(&self, eye: Eye) -> Option<&Slot<H>> {
        self.layout
            .eyes()
            .contains(&eye)
            .then(|| &self.slots[self.first + eye.index()])
    }

    pub fn state(&self, eye: Eye) -> DecodeState {
        self.slot(eye).map_or(DecodeState::Empty, Slot::state)
    }

    pub fn frame(&self, eye: Eye) -> Option<&Frame> {
        self.slot(eye).and_then(|slot| slot.frame.as_ref())
    }

    pub fn handle(&self, eye: Eye) -> Option<&H> {
        self.slot(eye).and_then(|slot| slot.handle.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::CanvasSurface;
    use image::Rgb;
    use rstest::rstest;
    use std::sync::Arc;

    type Cache = ImageCache<<CanvasSurface as DisplaySurface>::Handle>;

    fn frame(value: u8) -> Frame {
        Frame::from_pixel(3, 2, Rgb([value, value, value]))
    }

    #[test]
    fn slots_progress_through_states() {
        let cache = Cache::new(3, Layout::Mono);
        let mut surface = CanvasSurface::new((10, 10));
        assert_eq!(cache.get_entry(1).unwrap().state(Eye::Left), DecodeState::Empty);

        cache.store_decoded(1, Eye::Left, frame(5)).unwrap();
        assert!(cache.is_decoded(1, Eye::Left));
        assert!(!cache.is_ready(1, Eye::Left));
        assert_eq!(cache.get_entry(1).unwrap().state(Eye::Left), DecodeState::Decoded);

        assert!(cache.promote_to_ready(1, Eye::Left, &mut surface).unwrap());
        assert!(cache.is_ready(1, Eye::Left));
        let entry = cache.get_entry(1).unwrap();
        assert_eq!(entry.state(Eye::Left), DecodeState::Ready);
        assert!(entry.handle(Eye::Left).is_some());
        assert_eq!(entry.frame(Eye::Left), Some(&frame(5)));
    }

    #[rstest]
    #[case(3)]
    #[case(100)]
    fn out_of_range_entries_are_rejected(#[case] index: usize) {
        let cache = Cache::new(3, Layout::Stereo);
        assert!(matches!(
            cache.get_entry(index),
            Err(CacheError::OutOfRange { len: 3, .. })
        ));
        assert!(cache.store_decoded(index, Eye::Right, frame(1)).is_err());
        assert!(!cache.is_ready(index, Eye::Left));
    }

    #[test]
    fn mono_cache_has_no_right_eye() {
        let cache = Cache::new(2, Layout::Mono);
        assert!(matches!(
            cache.store_decoded(0, Eye::Right, frame(1)),
            Err(CacheError::MissingEye { .. })
        ));
        assert_eq!(cache.get_entry(0).unwrap().state(Eye::Right), DecodeState::Empty);
    }

    #[test]
    fn last_decode_wins_until_ready() {
        let cache = Cache::new(1, Layout::Mono);
        let mut surface = CanvasSurface::new((10, 10));
        cache.store_decoded(0, Eye::Left, frame(1)).unwrap();
        cache.store_decoded(0, Eye::Left, frame(2)).unwrap();
        assert_eq!(cache.get_entry(0).unwrap().frame(Eye::Left), Some(&frame(2)));

        cache.promote_to_ready(0, Eye::Left, &mut surface).unwrap();
        cache.store_decoded(0, Eye::Left, frame(3)).unwrap();
        assert_eq!(cache.get_entry(0).unwrap().frame(Eye::Left), Some(&frame(2)));
    }

    #[test]
    fn promotion_is_a_noop_when_empty_or_ready() {
        let cache = Cache::new(1, Layout::Mono);
        let mut surface = CanvasSurface::new((10, 10));
        assert!(!cache.promote_to_ready(0, Eye::Left, &mut surface).unwrap());

        cache.store_decoded(0, Eye::Left, frame(1)).unwrap();
        assert!(cache.promote_to_ready(0, Eye::Left, &mut surface).unwrap());
        assert!(!cache.promote_to_ready(0, Eye::Left, &mut surface).unwrap());
    }

    #[test]
    fn promotion_requires_the_owning_thread() {
        let cache = Arc::new(Cache::new(1, Layout::Mono));
        cache.store_decoded(0, Eye::Left, frame(1)).unwrap();

        let remote = Arc::clone(&cache);
        let result = std::thread::spawn(move || {
            let mut surface = CanvasSurface::new((10, 10));
            remote.promote_to_ready(0, Eye::Left, &mut surface)
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(CacheError::NotPrivileged)));
        assert!(!cache.is_ready(0, Eye::Left));
    }

    #[test]
    fn failures_are_reported_once() {
        let cache = Cache::new(2, Layout::Stereo);
        assert!(cache.mark_failed(1, Eye::Right));
        assert!(!cache.mark_failed(1, Eye::Right));
        assert!(cache.is_failed(1, Eye::Right));
        assert!(!cache.is_failed(1, Eye::Left));
    }

    #[test]
    fn entry_ready_needs_both_eyes() {
        let cache = Cache::new(1, Layout::Stereo);
        let mut surface = CanvasSurface::new((10, 10));
        cache.store_decoded(0, Eye::Left, frame(1)).unwrap();
        cache.promote_to_ready(0, Eye::Left, &mut surface).unwrap();
        assert!(!cache.is_entry_ready(0));

        cache.store_decoded(0, Eye::Right, frame(1)).unwrap();
        cache.promote_to_ready(0, Eye::Right, &mut surface).unwrap();
        assert!(cache.is_entry_ready(0));
        assert_eq!(cache.decoded_count(), 2);
    }
}
