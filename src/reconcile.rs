//! Low-confidence rescan reconciliation.
//!
//! Runs the detector a second time at a derived, lower threshold and promotes
//! only those boxes that survive the area/hull/confidence filters and land on
//! a planned gap location. Everything in here is best-effort: any failure
//! degrades to primary-only results instead of aborting the request.

use image::RgbImage;
use log::{debug, warn};

use crate::detection::{score_raw_detection, Scored};
use crate::detector::Detector;
use crate::geometry::distance;
use crate::planner::PlanOutcome;

/// Derived rescan threshold: half the primary confidence, bounded away from 0
/// and from values too close to the primary threshold to recover anything.
pub fn low_conf_threshold(confidence: f32) -> f32 {
    (confidence * 0.5).clamp(0.03, 0.30)
}

/// Outcome of the gap-filling sub-path.
///
/// `low_conf` travels with both variants because the assembler's acceptance
/// threshold switches to it as soon as it was computed, even if the rescan
/// itself failed afterwards.
#[derive(Debug)]
pub enum GapFill {
    Filled {
        detections: Vec<Scored>,
        low_conf: f32,
    },
    Degraded {
        reason: String,
        low_conf: Option<f32>,
    },
}

/// Run the rescan pass and reconcile it against the planned candidates.
///
/// With a degenerate hull the whole sub-path degrades before the detector is
/// invoked. With no hull (fewer than 3 primary centers) every surviving
/// rescan detection is accepted unmatched.
pub fn reconcile_rescan(
    detector: &mut dyn Detector,
    image: &RgbImage,
    confidence: f32,
    overlap: f32,
    plan: &PlanOutcome,
    median_area: f64,
) -> GapFill {
    let (hull, candidates, step) = match plan {
        PlanOutcome::Degenerate => {
            return GapFill::Degraded {
                reason: "degenerate hull from primary centers".to_string(),
                low_conf: None,
            };
        }
        PlanOutcome::NoHull => (None, &[][..], 0.0),
        PlanOutcome::Planned(p) => (Some(&p.hull), &p.candidates[..], p.step),
    };

    let low_conf = low_conf_threshold(confidence);
    let raw = match detector.detect(image, low_conf, overlap) {
        Ok(raw) => raw,
        Err(e) => {
            return GapFill::Degraded {
                reason: format!("rescan detection failed: {e}"),
                low_conf: Some(low_conf),
            };
        }
    };

    let mut survivors: Vec<Scored> = Vec::new();
    for det in &raw {
        // Anything at or above the primary threshold was already found by the
        // primary pass.
        if det.confidence >= confidence {
            continue;
        }
        let Some((scored, _crop)) = score_raw_detection(det, image, true) else {
            continue;
        };
        // Oversized boxes are spurious merges, not missed small objects.
        if median_area > 0.0 && scored.area as f64 >= 2.0 * median_area {
            continue;
        }
        if let Some(hull) = hull {
            if !crate::geometry::point_in_polygon(scored.center, hull) {
                continue;
            }
        }
        survivors.push(scored);
    }

    debug!(
        "rescan at conf {low_conf:.2}: {} raw, {} surviving filters",
        raw.len(),
        survivors.len()
    );

    if candidates.is_empty() {
        return GapFill::Filled {
            detections: survivors,
            low_conf,
        };
    }

    // First-match-wins assignment in candidate traversal order: each gap
    // location absorbs at most one detection and each detection fills at most
    // one gap.
    let mut used = vec![false; survivors.len()];
    let mut matched = Vec::new();
    for candidate in candidates {
        for (i, scored) in survivors.iter().enumerate() {
            if used[i] {
                continue;
            }
            if distance(scored.center, *candidate) < step {
                matched.push(scored.clone());
                used[i] = true;
                break;
            }
        }
    }

    GapFill::Filled {
        detections: matched,
        low_conf,
    }
}

/// Log a degradation; the request carries on with primary-only results.
pub fn log_degraded(reason: &str) {
    warn!("gap filling skipped: {reason}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RawDetection;
    use crate::planner::{plan_candidates, CandidatePlan};
    use anyhow::Result;

    struct ScriptedDetector {
        responses: Vec<Result<Vec<RawDetection>>>,
    }

    impl Detector for ScriptedDetector {
        fn detect(
            &mut self,
            _image: &RgbImage,
            _confidence: f32,
            _overlap: f32,
        ) -> Result<Vec<RawDetection>> {
            self.responses.remove(0)
        }
    }

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> RawDetection {
        RawDetection {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id: 0,
            class_name: "flower".to_string(),
        }
    }

    fn test_image() -> RgbImage {
        RgbImage::from_pixel(400, 400, image::Rgb([90, 60, 120]))
    }

    #[test]
    fn test_low_conf_threshold_bounds() {
        for i in 0..=100 {
            let c = i as f32 / 100.0;
            let low = low_conf_threshold(c);
            assert!((0.03..=0.30).contains(&low), "c={c} low={low}");
        }
        // Strictly below the primary threshold across the useful range.
        for i in 31..=100 {
            let c = i as f32 / 100.0;
            assert!(low_conf_threshold(c) < c);
        }
        assert_eq!(low_conf_threshold(0.5), 0.25);
        assert_eq!(low_conf_threshold(1.0), 0.30);
        assert_eq!(low_conf_threshold(0.02), 0.03);
    }

    #[test]
    fn test_degenerate_plan_skips_detector_entirely() {
        let mut detector = ScriptedDetector { responses: vec![] };
        let gap = reconcile_rescan(
            &mut detector,
            &test_image(),
            0.5,
            0.45,
            &PlanOutcome::Degenerate,
            900.0,
        );
        match gap {
            GapFill::Degraded { low_conf, .. } => assert!(low_conf.is_none()),
            other => panic!("expected degraded, got {other:?}"),
        }
    }

    #[test]
    fn test_rescan_failure_degrades_with_low_conf() {
        let mut detector = ScriptedDetector {
            responses: vec![Err(anyhow::anyhow!("model exploded"))],
        };
        let gap = reconcile_rescan(
            &mut detector,
            &test_image(),
            0.5,
            0.45,
            &PlanOutcome::NoHull,
            900.0,
        );
        match gap {
            GapFill::Degraded { low_conf, reason } => {
                assert_eq!(low_conf, Some(0.25));
                assert!(reason.contains("rescan"));
            }
            other => panic!("expected degraded, got {other:?}"),
        }
    }

    #[test]
    fn test_no_hull_accepts_all_qualifying_survivors() {
        let mut detector = ScriptedDetector {
            responses: vec![Ok(vec![
                raw(10.0, 10.0, 40.0, 40.0, 0.2),
                // At the primary threshold: a duplicate of the primary pass.
                raw(50.0, 50.0, 80.0, 80.0, 0.5),
                // Oversized relative to the median area.
                raw(100.0, 100.0, 200.0, 200.0, 0.2),
            ])],
        };
        let gap = reconcile_rescan(
            &mut detector,
            &test_image(),
            0.5,
            0.45,
            &PlanOutcome::NoHull,
            900.0,
        );
        match gap {
            GapFill::Filled {
                detections,
                low_conf,
            } => {
                assert_eq!(low_conf, 0.25);
                assert_eq!(detections.len(), 1);
                assert_eq!(detections[0].record.bbox, [10, 10, 40, 40]);
                assert!(detections[0].record.inferred);
            }
            other => panic!("expected filled, got {other:?}"),
        }
    }

    #[test]
    fn test_hull_membership_filters_outsiders() {
        let centers = [
            (152.0, 152.0),
            (248.0, 152.0),
            (152.0, 248.0),
            (248.0, 248.0),
        ];
        let plan = plan_candidates(&centers, 900.0);
        let mut detector = ScriptedDetector {
            responses: vec![Ok(vec![
                // Center (200, 200): inside the hull, near a candidate.
                raw(185.0, 185.0, 215.0, 215.0, 0.15),
                // Center (40, 40): well outside the hull.
                raw(25.0, 25.0, 55.0, 55.0, 0.15),
            ])],
        };
        let gap = reconcile_rescan(&mut detector, &test_image(), 0.5, 0.45, &plan, 900.0);
        match gap {
            GapFill::Filled { detections, .. } => {
                assert_eq!(detections.len(), 1);
                assert_eq!(detections[0].center, (200.0, 200.0));
            }
            other => panic!("expected filled, got {other:?}"),
        }
    }

    #[test]
    fn test_matching_is_one_to_one() {
        // Two candidates, three survivors clustered around the first one:
        // each candidate absorbs at most one detection and no detection is
        // used twice.
        let plan = PlanOutcome::Planned(CandidatePlan {
            hull: vec![(0.0, 0.0), (400.0, 0.0), (400.0, 400.0), (0.0, 400.0)],
            spacing: 30.0,
            step: 60.0,
            candidates: vec![(100.0, 100.0), (130.0, 100.0)],
        });
        let mut detector = ScriptedDetector {
            responses: vec![Ok(vec![
                raw(85.0, 85.0, 115.0, 115.0, 0.2),
                raw(90.0, 90.0, 120.0, 120.0, 0.2),
                raw(95.0, 95.0, 125.0, 125.0, 0.2),
            ])],
        };
        let gap = reconcile_rescan(&mut detector, &test_image(), 0.5, 0.45, &plan, 900.0);
        match gap {
            GapFill::Filled { detections, .. } => {
                assert_eq!(detections.len(), 2);
                assert_ne!(detections[0].record.bbox, detections[1].record.bbox);
            }
            other => panic!("expected filled, got {other:?}"),
        }
    }

    #[test]
    fn test_unmatched_survivors_dropped() {
        let plan = PlanOutcome::Planned(CandidatePlan {
            hull: vec![(0.0, 0.0), (400.0, 0.0), (400.0, 400.0), (0.0, 400.0)],
            spacing: 30.0,
            step: 60.0,
            candidates: vec![(300.0, 300.0)],
        });
        let mut detector = ScriptedDetector {
            responses: vec![Ok(vec![raw(10.0, 10.0, 40.0, 40.0, 0.2)])],
        };
        let gap = reconcile_rescan(&mut detector, &test_image(), 0.5, 0.45, &plan, 900.0);
        match gap {
            GapFill::Filled { detections, .. } => assert!(detections.is_empty()),
            other => panic!("expected filled, got {other:?}"),
        }
    }
}
