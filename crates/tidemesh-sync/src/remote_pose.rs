//! Interpolation of poses reported by remote peers.
//!
//! Each subject keeps its two newest samples by sender timestamp. Rendering
//! runs `interpolation_delay` behind the newest sample, advanced by local
//! time since that sample arrived, and is clamped to the two samples so it
//! never extrapolates.

use std::collections::HashMap;
use std::f32::consts::{PI, TAU};
use std::time::{Duration, Instant};

use tidemesh_net::{Pose, SubjectId};

/// One received pose.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PoseSample {
    pose: Pose,
    /// Sender clock, milliseconds.
    timestamp_ms: u64,
    received_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct SampleWindow {
    older: Option<PoseSample>,
    newest: PoseSample,
}

/// Latest remote poses per subject.
#[derive(Debug)]
pub struct RemotePoses {
    delay: Duration,
    subjects: HashMap<SubjectId, SampleWindow>,
}

impl RemotePoses {
    /// Render `delay` behind the newest sample.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            subjects: HashMap::new(),
        }
    }

    /// Record a sample. Returns `false` (and drops it) if it is not newer
    /// than the newest sample already held for the subject.
    pub fn push(&mut self, subject: SubjectId, pose: Pose, timestamp_ms: u64, now: Instant) -> bool {
        let sample = PoseSample {
            pose,
            timestamp_ms,
            received_at: now,
        };
        match self.subjects.get_mut(&subject) {
            Some(window) if timestamp_ms <= window.newest.timestamp_ms => {
                tracing::trace!(
                    "stale pose for {subject}: {timestamp_ms} <= {}",
                    window.newest.timestamp_ms
                );
                false
            }
            Some(window) => {
                window.older = Some(window.newest);
                window.newest = sample;
                true
            }
            None => {
                self.subjects.insert(
                    subject,
                    SampleWindow {
                        older: None,
                        newest: sample,
                    },
                );
                true
            }
        }
    }

    /// Interpolated pose of a subject at local time `now`.
    pub fn sample(&self, subject: &SubjectId, now: Instant) -> Option<Pose> {
        let window = self.subjects.get(subject)?;
        let newest = window.newest;
        let Some(older) = window.older else {
            return Some(newest.pose);
        };
        let span = newest.timestamp_ms - older.timestamp_ms;
        if span == 0 {
            return Some(newest.pose);
        }

        let since_arrival = now.saturating_duration_since(newest.received_at).as_millis() as f64;
        let render = newest.timestamp_ms as f64 + since_arrival - self.delay.as_millis() as f64;
        let t = ((render - older.timestamp_ms as f64) / span as f64).clamp(0.0, 1.0) as f32;
        Some(lerp_pose(&older.pose, &newest.pose, t))
    }

    /// Drop a subject (controller changed, peer left).
    pub fn forget(&mut self, subject: &SubjectId) {
        self.subjects.remove(subject);
    }

    /// Drop every subject.
    pub fn clear(&mut self) {
        self.subjects.clear();
    }
}

/// Linear position and shortest-arc heading interpolation.
pub fn lerp_pose(a: &Pose, b: &Pose, t: f32) -> Pose {
    Pose {
        position: a.position.lerp(b.position, t),
        heading: a.heading + shortest_arc(a.heading, b.heading) * t,
    }
}

/// Signed angle from `from` to `to`, in `[-π, π)`.
fn shortest_arc(from: f32, to: f32) -> f32 {
    (to - from + PI).rem_euclid(TAU) - PI
}
