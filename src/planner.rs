//! Spatial candidate planner.
//!
//! Builds the convex hull of the primary detection centers and lays a lattice
//! of plausible missed-object locations inside it. Lattice spacing is derived
//! from the median observed bbox footprint, so dense scenes of small objects
//! get a fine grid and sparse scenes of large objects a coarse one.

use crate::geometry::{convex_hull, distance, point_in_polygon, Point};

/// Minimum lattice spacing in pixels, used when the median area is zero or
/// implies something smaller.
pub const MIN_SPACING: f64 = 30.0;

#[derive(Debug, Clone)]
pub struct CandidatePlan {
    /// Hull of the primary centers, at least 3 vertices.
    pub hull: Vec<Point>,
    pub spacing: f64,
    /// Lattice stride and matching radius, always `2 * spacing`.
    pub step: f64,
    /// Lattice points inside the hull, in x-major traversal order.
    pub candidates: Vec<Point>,
}

#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// Fewer than 3 centers: no hull exists, the rescan runs unmasked.
    NoHull,
    /// At least 3 centers but they collapse to a degenerate hull (collinear);
    /// the whole gap-filling path degrades.
    Degenerate,
    Planned(CandidatePlan),
}

/// Lattice spacing from the median bbox area, floored at [`MIN_SPACING`].
pub fn lattice_spacing(median_area: f64) -> f64 {
    median_area.max(0.0).sqrt().floor().max(MIN_SPACING)
}

/// Plan candidate gap locations for the given primary centers.
///
/// A lattice point qualifies as a candidate when it lies inside the hull and
/// not within `spacing` of any existing center; a point already covered by a
/// detection is not a gap.
pub fn plan_candidates(centers: &[Point], median_area: f64) -> PlanOutcome {
    if centers.len() < 3 {
        return PlanOutcome::NoHull;
    }

    let hull = convex_hull(centers);
    if hull.len() < 3 {
        return PlanOutcome::Degenerate;
    }

    let spacing = lattice_spacing(median_area);
    let step = spacing * 2.0;

    let min_x = hull.iter().map(|p| p.0).fold(f64::INFINITY, f64::min) as i64;
    let max_x = hull.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max) as i64;
    let min_y = hull.iter().map(|p| p.1).fold(f64::INFINITY, f64::min) as i64;
    let max_y = hull.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max) as i64;
    let stride = step as i64;

    let mut candidates = Vec::new();
    let mut x = min_x;
    while x < max_x {
        let mut y = min_y;
        while y < max_y {
            let pt = (x as f64, y as f64);
            if point_in_polygon(pt, &hull)
                && !centers.iter().any(|c| distance(pt, *c) <= spacing)
            {
                candidates.push(pt);
            }
            y += stride;
        }
        x += stride;
    }

    PlanOutcome::Planned(CandidatePlan {
        hull,
        spacing,
        step,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fewer_than_three_centers_yields_no_hull() {
        assert!(matches!(plan_candidates(&[], 900.0), PlanOutcome::NoHull));
        assert!(matches!(
            plan_candidates(&[(10.0, 10.0), (50.0, 50.0)], 900.0),
            PlanOutcome::NoHull
        ));
    }

    #[test]
    fn test_collinear_centers_degenerate() {
        let centers = [(0.0, 0.0), (50.0, 50.0), (100.0, 100.0)];
        assert!(matches!(
            plan_candidates(&centers, 900.0),
            PlanOutcome::Degenerate
        ));
    }

    #[test]
    fn test_spacing_floors_at_minimum() {
        assert_eq!(lattice_spacing(0.0), 30.0);
        assert_eq!(lattice_spacing(100.0), 30.0);
        assert_eq!(lattice_spacing(2500.0), 50.0);
        // Non-square median areas truncate.
        assert_eq!(lattice_spacing(2600.0), 50.0);
    }

    #[test]
    fn test_candidates_strictly_inside_hull() {
        // Square of centers 96 apart; area 900 gives spacing 30, step 60.
        let centers = [
            (152.0, 152.0),
            (248.0, 152.0),
            (152.0, 248.0),
            (248.0, 248.0),
        ];
        let plan = match plan_candidates(&centers, 900.0) {
            PlanOutcome::Planned(p) => p,
            other => panic!("expected plan, got {other:?}"),
        };
        assert_eq!(plan.spacing, 30.0);
        assert_eq!(plan.step, 60.0);
        // Lattice visits x,y in {152, 212}. (152, 152) coincides with a
        // center; the ray cast's half-open boundary rule keeps the low-side
        // edge points and drops nothing else.
        assert_eq!(
            plan.candidates,
            vec![(152.0, 212.0), (212.0, 152.0), (212.0, 212.0)]
        );
    }

    #[test]
    fn test_candidate_near_existing_center_excluded() {
        // Same square but a large spacing radius swallows the interior point.
        let centers = [
            (152.0, 152.0),
            (248.0, 152.0),
            (152.0, 248.0),
            (248.0, 248.0),
        ];
        let plan = match plan_candidates(&centers, 3600.0) {
            PlanOutcome::Planned(p) => p,
            other => panic!("expected plan, got {other:?}"),
        };
        // spacing 60 (step 120): the lone lattice point after the start is
        // outside or boundary, so nothing qualifies.
        assert!(plan.candidates.is_empty());
    }

    #[test]
    fn test_empty_candidate_list_with_valid_hull_is_ok() {
        // Tiny hull relative to the stride produces a valid plan with no
        // candidates.
        let centers = [(10.0, 10.0), (20.0, 10.0), (15.0, 20.0)];
        match plan_candidates(&centers, 0.0) {
            PlanOutcome::Planned(p) => assert!(p.candidates.is_empty()),
            other => panic!("expected plan, got {other:?}"),
        }
    }
}
