//! Posture measurements derived from worker landmark replies.
//!
//! The neck angle is the angle at the nose between the two shoulders: it
//! widens as the head drops forward toward the shoulder line.

use chrono::{DateTime, Utc};
use serde::Serialize;

use textneck_types::{Thresholds, WorkerReply};

const NOSE: usize = 0;
const LEFT_SHOULDER: usize = 5;
const RIGHT_SHOULDER: usize = 6;

/// Keypoints below this confidence are treated as not detected.
pub const MIN_KEYPOINT_CONFIDENCE: f32 = 0.3;

/// Angle at `b` formed by `a` and `c`, in degrees. Zero when either arm has
/// no length.
pub fn calculate_angle(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    let ba = (a.0 - b.0, a.1 - b.1);
    let bc = (c.0 - b.0, c.1 - b.1);
    let denom = ba.0.hypot(ba.1) * bc.0.hypot(bc.1);
    if denom == 0.0 {
        return 0.0;
    }
    let cosine = ((ba.0 * bc.0 + ba.1 * bc.1) / denom).clamp(-1.0, 1.0);
    cosine.acos().to_degrees()
}

/// Pixel measurements for one frame. Fields are `None` when the landmarks
/// they need were not detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Measurement {
    pub neck_angle_deg: Option<f64>,
    pub shoulder_y_diff_px: Option<f64>,
    pub shoulder_y_avg_px: Option<f64>,
}

impl Measurement {
    pub fn has_angle(&self) -> bool {
        self.neck_angle_deg.is_some()
    }

    /// A storable record, only when every value is present.
    pub fn record(&self, logged_at: DateTime<Utc>) -> Option<MeasurementRecord> {
        Some(MeasurementRecord {
            angle: self.neck_angle_deg?,
            shoulder_y_diff: self.shoulder_y_diff_px?,
            shoulder_y_avg: self.shoulder_y_avg_px?,
            logged_at,
        })
    }
}

/// One persisted per-frame measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub angle: f64,
    pub shoulder_y_diff: f64,
    pub shoulder_y_avg: f64,
    pub logged_at: DateTime<Utc>,
}

/// Measure posture from a successful worker reply.
pub fn measure(reply: &WorkerReply) -> Measurement {
    let Some(points) = reply.points.as_deref() else {
        return Measurement::default();
    };
    let width = f64::from(reply.width.unwrap_or(1));
    let height = f64::from(reply.height.unwrap_or(1));

    let to_px = |index: usize| -> Option<(f64, f64)> {
        let [x, y, confidence] = *points.get(index)?;
        (confidence >= MIN_KEYPOINT_CONFIDENCE)
            .then(|| (f64::from(x) * width, f64::from(y) * height))
    };

    let nose = to_px(NOSE);
    let left = to_px(LEFT_SHOULDER);
    let right = to_px(RIGHT_SHOULDER);

    let mut measurement = Measurement::default();
    if let (Some(left), Some(right)) = (left, right) {
        measurement.shoulder_y_diff_px = Some((left.1 - right.1).abs());
        measurement.shoulder_y_avg_px = Some((left.1 + right.1) / 2.0);
        if let Some(nose) = nose {
            measurement.neck_angle_deg = Some(calculate_angle(left, nose, right));
        }
    }
    measurement
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Posture {
    Good,
    Poor,
    Unknown,
}

/// Tracks consecutive poor-posture frames against the session thresholds.
#[derive(Debug, Clone)]
pub struct PostureTracker {
    thresholds: Thresholds,
    poor_streak: u32,
}

impl PostureTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            poor_streak: 0,
        }
    }

    #[cfg(test)]
    pub fn poor_streak(&self) -> u32 {
        self.poor_streak
    }

    /// Classify one frame without touching the streak.
    pub fn classify(&self, m: &Measurement) -> Posture {
        let angle_poor = m.neck_angle_deg.map(|a| a >= self.thresholds.angle_deg);
        let shoulders_poor = m
            .shoulder_y_diff_px
            .map(|d| d >= self.thresholds.shoulder_diff_px);

        match (angle_poor, shoulders_poor) {
            (None, None) => Posture::Unknown,
            (Some(true), _) | (_, Some(true)) => Posture::Poor,
            _ => Posture::Good,
        }
    }

    /// Classify and update the streak. Returns the posture and whether the
    /// poor streak has reached the alert threshold. Unknown frames leave the
    /// streak as it was.
    pub fn observe(&mut self, m: &Measurement) -> (Posture, bool) {
        let posture = self.classify(m);
        match posture {
            Posture::Poor => self.poor_streak = self.poor_streak.saturating_add(1),
            Posture::Good => self.poor_streak = 0,
            Posture::Unknown => {}
        }
        let alert =
            posture == Posture::Poor && self.poor_streak >= self.thresholds.alert_frames.max(1);
        (posture, alert)
    }

    pub fn reset(&mut self) {
        self.poor_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(points: Vec<[f32; 3]>, size: Option<(u32, u32)>) -> WorkerReply {
        WorkerReply::success("id", points, size)
    }

    /// 17 keypoints with nose and shoulders placed as given, the rest undetected.
    fn pose(nose: [f32; 3], left: [f32; 3], right: [f32; 3]) -> Vec<[f32; 3]> {
        let mut points = vec![[0.0, 0.0, 0.0]; 17];
        points[NOSE] = nose;
        points[LEFT_SHOULDER] = left;
        points[RIGHT_SHOULDER] = right;
        points
    }

    #[test]
    fn test_calculate_angle() {
        let right = calculate_angle((1.0, 0.0), (0.0, 0.0), (0.0, 1.0));
        assert!((right - 90.0).abs() < 1e-9);
        let straight = calculate_angle((-1.0, 0.0), (0.0, 0.0), (1.0, 0.0));
        assert!((straight - 180.0).abs() < 1e-9);
        assert_eq!(calculate_angle((0.0, 0.0), (0.0, 0.0), (1.0, 1.0)), 0.0);
    }

    #[test]
    fn test_measure_in_pixels() {
        // Nose 100px above the shoulder midpoint, shoulders 200px apart.
        let m = measure(&reply(
            pose([0.5, 0.25, 0.9], [0.25, 0.5, 0.9], [0.75, 0.5, 0.9]),
            Some((400, 400)),
        ));
        assert!(m.has_angle());
        assert!((m.neck_angle_deg.unwrap() - 90.0).abs() < 1e-3);
        assert_eq!(m.shoulder_y_diff_px, Some(0.0));
        assert_eq!(m.shoulder_y_avg_px, Some(200.0));
    }

    #[test]
    fn test_measure_missing_landmarks() {
        let no_nose = measure(&reply(
            pose([0.5, 0.25, 0.1], [0.25, 0.5, 0.9], [0.75, 0.6, 0.9]),
            Some((100, 100)),
        ));
        assert!(!no_nose.has_angle());
        assert!((no_nose.shoulder_y_diff_px.unwrap() - 10.0).abs() < 1e-3);

        let empty = measure(&reply(Vec::new(), None));
        assert_eq!(empty, Measurement::default());
        assert!(empty.record(Utc::now()).is_none());
    }

    #[test]
    fn test_tracker_streak_and_alert() {
        let mut tracker = PostureTracker::new(Thresholds {
            angle_deg: 100.0,
            shoulder_diff_px: 10.0,
            alert_frames: 2,
        });
        let poor = Measurement {
            neck_angle_deg: Some(130.0),
            shoulder_y_diff_px: Some(1.0),
            shoulder_y_avg_px: Some(50.0),
        };
        let good = Measurement {
            neck_angle_deg: Some(80.0),
            ..poor
        };

        assert_eq!(tracker.observe(&poor), (Posture::Poor, false));
        assert_eq!(
            tracker.observe(&Measurement::default()),
            (Posture::Unknown, false)
        );
        assert_eq!(tracker.observe(&poor), (Posture::Poor, true));
        assert_eq!(tracker.poor_streak(), 2);
        assert_eq!(tracker.observe(&good), (Posture::Good, false));
        assert_eq!(tracker.poor_streak(), 0);
    }

    #[test]
    fn test_uneven_shoulders_are_poor() {
        let tracker = PostureTracker::new(Thresholds::default());
        let m = Measurement {
            neck_angle_deg: None,
            shoulder_y_diff_px: Some(25.0),
            shoulder_y_avg_px: Some(200.0),
        };
        assert_eq!(tracker.classify(&m), Posture::Poor);
    }
}
