//! Kinematic tracking state and the ring buffer it is published through.

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of historical states kept by the tracker.
pub const DEFAULT_RING_CAPACITY: usize = 128;

/// One filter output.
///
/// `rotation` maps sensor space to the world frame fixed at warm-up (world
/// `+z` is up). Translation and velocities are world-space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingState {
    pub time_stamp: u32,
    pub linear_acceleration: Vector3<f64>,
    pub linear_velocity: Vector3<f64>,
    pub translation: Vector3<f64>,
    /// Bias-corrected angular velocity in sensor space.
    pub angular_velocity: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            time_stamp: 0,
            linear_acceleration: Vector3::zeros(),
            linear_velocity: Vector3::zeros(),
            translation: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Cursors {
    most_recent: usize,
    /// Number of slots holding a real state (saturates at capacity).
    len: usize,
    /// Total pushes so far.
    pushed: u64,
    /// Value of `pushed` at the last [`StateRing::lock_new`].
    locked_at: u64,
}

/// Fixed-size arena of states with a "most recent" cursor and a locked copy.
///
/// The cursor lock only covers index reads and writes. Each slot has its own
/// lock held for a single copy, and the writer fills the slot after
/// `most_recent` before advancing the cursor, so a reader never sees a
/// half-written state. The locked state lives outside the ring, so the
/// writer may wrap any number of times without touching it.
#[derive(Debug)]
pub struct StateRing {
    slots: Box<[Mutex<TrackingState>]>,
    locked: Mutex<TrackingState>,
    cursors: Mutex<Cursors>,
}

impl StateRing {
    /// A ring with `capacity` slots (at least 2), seeded with `initial` as
    /// both the most recent and the locked state.
    pub fn new(capacity: usize, initial: TrackingState) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|_| Mutex::new(initial))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            locked: Mutex::new(initial),
            cursors: Mutex::new(Cursors {
                most_recent: 0,
                len: 1,
                pushed: 0,
                locked_at: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of valid historical states.
    pub fn len(&self) -> usize {
        self.cursors.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a state and make it the most recent one.
    pub fn push(&self, state: TrackingState) {
        let next = (self.cursors.lock().most_recent + 1) % self.slots.len();
        *self.slots[next].lock() = state;

        let mut cursors = self.cursors.lock();
        cursors.most_recent = next;
        cursors.len = (cursors.len + 1).min(self.slots.len());
        cursors.pushed += 1;
    }

    /// Copy of the most recent state.
    pub fn most_recent(&self) -> TrackingState {
        let idx = self.cursors.lock().most_recent;
        *self.slots[idx].lock()
    }

    /// Edit the most recent state in place.
    pub fn modify_most_recent<R>(&self, f: impl FnOnce(&mut TrackingState) -> R) -> R {
        let idx = self.cursors.lock().most_recent;
        let mut slot = self.slots[idx].lock();
        f(&mut slot)
    }

    /// Copy the most recent state into the locked one.
    ///
    /// Returns `true` if states were pushed since the previous call. Edits
    /// made through [`modify_most_recent`](Self::modify_most_recent) are
    /// picked up either way.
    pub fn lock_new(&self) -> bool {
        let mut cursors = self.cursors.lock();
        let changed = cursors.locked_at != cursors.pushed;
        cursors.locked_at = cursors.pushed;
        *self.locked.lock() = *self.slots[cursors.most_recent].lock();
        changed
    }

    /// Copy of the locked state.
    pub fn locked(&self) -> TrackingState {
        *self.locked.lock()
    }

    /// The stored state closest in time to `time_stamp`.
    ///
    /// Time is measured backwards from the most recent state with wrapping
    /// 32-bit arithmetic, so a stamp is "older" when its wrapped age is
    /// positive. Stamps in the future clamp to the newest state and stamps
    /// older than the ring clamp to the oldest one.
    pub fn closest_to(&self, time_stamp: u32) -> TrackingState {
        let Cursors {
            most_recent, len, ..
        } = *self.cursors.lock();
        let capacity = self.slots.len();
        let at = |k: usize| *self.slots[(most_recent + capacity - k) % capacity].lock();

        let newest = at(0);
        let age_of = |s: &TrackingState| newest.time_stamp.wrapping_sub(s.time_stamp) as i32 as i64;
        let target = newest.time_stamp.wrapping_sub(time_stamp) as i32 as i64;
        if target <= 0 || len <= 1 {
            return newest;
        }

        // first k whose age reaches the target
        let (mut lo, mut hi) = (0usize, len - 1);
        if age_of(&at(hi)) < target {
            return at(hi);
        }
        while lo < hi {
            let mid = (lo + hi) / 2;
            if age_of(&at(mid)) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let later = at(lo - 1);
        let earlier = at(lo);
        if target - age_of(&later) <= age_of(&earlier) - target {
            later
        } else {
            earlier
        }
    }
}
