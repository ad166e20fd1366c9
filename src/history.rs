//! Append-only per-tourist trajectories.
//!
//! Tracks are sharded by tourist id: the outer [`DashMap`] is only touched to
//! find (or lazily create) a track, and each track sits behind its own mutex.
//! Work on different tourists never contends on a shared lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::stop::DwellWindow;
use crate::{GpsFix, InputError, TouristId};

/// One tourist's fixes, strictly increasing by timestamp.
#[derive(Debug, Clone)]
pub struct TouristTrack {
    tourist_id: TouristId,
    fixes: Vec<GpsFix>,
    dwell: DwellWindow,
}

impl TouristTrack {
    pub fn new(tourist_id: TouristId) -> Self {
        Self { tourist_id, fixes: Vec::new(), dwell: DwellWindow::Moving }
    }

    pub fn tourist_id(&self) -> TouristId {
        self.tourist_id
    }

    pub fn fixes(&self) -> &[GpsFix] {
        &self.fixes
    }

    /// Most recent fix, if any.
    pub fn last(&self) -> Option<&GpsFix> {
        self.fixes.last()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    /// Dwell state as of the most recent fix.
    pub fn dwell(&self) -> DwellWindow {
        self.dwell
    }

    /// Check that `fix` could be appended without storing it.
    pub fn check_append(&self, fix: &GpsFix) -> Result<(), InputError> {
        fix.validate()?;
        if let Some(last) = self.fixes.last() {
            if fix.timestamp <= last.timestamp {
                return Err(InputError::OutOfOrder {
                    tourist_id: self.tourist_id,
                    timestamp: fix.timestamp,
                    last: last.timestamp,
                });
            }
        }
        Ok(())
    }

    /// Append a fix. Rejected fixes leave the track untouched.
    pub fn push(&mut self, fix: GpsFix) -> Result<(), InputError> {
        self.check_append(&fix)?;
        self.fixes.push(fix);
        Ok(())
    }

    pub(crate) fn set_dwell(&mut self, dwell: DwellWindow) {
        self.dwell = dwell;
    }

    fn snapshot(&self) -> TrackHistory {
        TrackHistory { fixes: Arc::from(self.fixes.as_slice()) }
    }
}

/// A point-in-time view of one track.
///
/// Iterating it is lazy and can be restarted any number of times; later
/// appends to the live track are not reflected.
#[derive(Debug, Clone)]
pub struct TrackHistory {
    fixes: Arc<[GpsFix]>,
}

impl TrackHistory {
    fn empty() -> Self {
        Self { fixes: Arc::from(Vec::new()) }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GpsFix> {
        self.fixes.iter()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn to_vec(&self) -> Vec<GpsFix> {
        self.fixes.to_vec()
    }
}

impl<'a> IntoIterator for &'a TrackHistory {
    type Item = &'a GpsFix;
    type IntoIter = std::slice::Iter<'a, GpsFix>;

    fn into_iter(self) -> Self::IntoIter {
        self.fixes.iter()
    }
}

/// All tracks known to the process. Grows for the process lifetime.
#[derive(Debug, Default)]
pub struct HistoryStore {
    tracks: DashMap<TouristId, Arc<Mutex<TouristTrack>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to a tourist's track, created empty on first use.
    ///
    /// Lock the handle to serialize every read-then-append for that tourist.
    pub fn track(&self, tourist_id: TouristId) -> Arc<Mutex<TouristTrack>> {
        self.tracks
            .entry(tourist_id)
            .or_insert_with(|| Arc::new(Mutex::new(TouristTrack::new(tourist_id))))
            .value()
            .clone()
    }

    /// Append a fix to its tourist's track.
    pub fn append(&self, fix: GpsFix) -> Result<(), InputError> {
        // Validate before touching the map so bad input never creates a track
        fix.validate()?;
        let track = self.track(fix.tourist_id);
        let mut track = track.lock();
        track.push(fix)
    }

    /// The tourist's fixes in timestamp order. Unknown ids yield an empty history.
    pub fn history(&self, tourist_id: TouristId) -> TrackHistory {
        let track = match self.tracks.get(&tourist_id) {
            Some(entry) => entry.value().clone(),
            None => return TrackHistory::empty(),
        };
        let snapshot = track.lock().snapshot();
        snapshot
    }

    /// Every stored fix, grouped by tourist (ascending id) and ordered by time
    /// within each tourist.
    pub fn all_fixes(&self) -> Vec<GpsFix> {
        let mut handles: Vec<(TouristId, Arc<Mutex<TouristTrack>>)> = self
            .tracks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut fixes = Vec::new();
        for (_, track) in handles {
            fixes.extend_from_slice(track.lock().fixes());
        }
        fixes
    }

    /// Number of tourists with a track (including ones whose only fix was rejected
    /// after the track was created).
    pub fn tourist_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn total_fixes(&self) -> usize {
        let handles: Vec<Arc<Mutex<TouristTrack>>> =
            self.tracks.iter().map(|entry| entry.value().clone()).collect();
        handles.iter().map(|track| track.lock().len()).sum()
    }
}
