//! Apparent-power constraint factory.
//!
//! A converter's physical capability bounds its (active, reactive) operating
//! point to the disk `P² + Q² <= S²`. The factory approximates that disk from
//! the inside with an inscribed polygon of linear half-planes, so the solver
//! can honour it without leaving linear programming. More segments per
//! quadrant tighten the approximation at the cost of more rows.

use std::f64::consts::TAU;

use crate::domain::{Coefficient, Constraint, ConstraintKind, DeviceId, Phase, PowerKind, Relationship};

/// Default circle segments per quadrant; two keeps the row count small while
/// staying within ~8 % of the true disk radius.
pub const DEFAULT_SEGMENTS_PER_QUADRANT: u32 = 2;

/// Builds the inscribed-polygon constraints for an apparent-power limit of
/// `limit_va` on the given device and phase selector.
///
/// Samples `4 * segments_per_quadrant` equally spaced points on the circle;
/// each consecutive pair contributes the chord half-plane `m*P - Q <= -b`
/// (lower half) or `m*P - Q >= -b` (upper half). The polygon never exceeds
/// the true circle. A non-positive limit degrades to the degenerate
/// `P = 0`, `Q = 0` pair.
pub fn apparent_power_constraints(
    device: DeviceId,
    phase: Phase,
    kind: ConstraintKind,
    limit_va: f64,
    segments_per_quadrant: u32,
) -> Vec<Constraint> {
    let active = Coefficient {
        device,
        phase,
        power: PowerKind::Active,
    };
    let reactive = Coefficient {
        device,
        phase,
        power: PowerKind::Reactive,
    };

    if limit_va <= 0.0 {
        return vec![
            Constraint::new(
                format!("{device} apparent power exhausted (P)"),
                kind,
                vec![(active, 1.0)],
                Relationship::Eq,
                0.0,
            ),
            Constraint::new(
                format!("{device} apparent power exhausted (Q)"),
                kind,
                vec![(reactive, 1.0)],
                Relationship::Eq,
                0.0,
            ),
        ];
    }

    let points = 4 * segments_per_quadrant.max(1) as usize;
    let sample = |i: usize| {
        let angle = TAU * i as f64 / points as f64;
        (limit_va * angle.cos(), limit_va * angle.sin())
    };

    let mut constraints = Vec::with_capacity(points);
    for i in 0..points {
        let (x1, y1) = sample(i);
        let (x2, y2) = sample((i + 1) % points);
        let dx = x2 - x1;
        // Equally spaced samples never produce a vertical chord, but the
        // slope division must not blow up on degenerate input.
        if dx.abs() < f64::EPSILON {
            continue;
        }
        let slope = (y2 - y1) / dx;
        let intercept = y1 - slope * x1;
        // Chords never straddle the P axis: the sample set always contains
        // (S, 0) and (-S, 0).
        let upper_half = y1 + y2 > 0.0;
        let relationship = if upper_half {
            Relationship::Geq
        } else {
            Relationship::Leq
        };
        constraints.push(Constraint::new(
            format!("{device} apparent power {limit_va:.0} VA segment {i}"),
            kind,
            vec![(active, slope), (reactive, -1.0)],
            relationship,
            -intercept,
        ));
    }
    constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn satisfies(constraint: &Constraint, p: f64, q: f64) -> bool {
        let lhs: f64 = constraint
            .terms
            .iter()
            .map(|(coefficient, weight)| match coefficient.power {
                PowerKind::Active => weight * p,
                PowerKind::Reactive => weight * q,
            })
            .sum();
        let value = constraint.value.unwrap();
        match constraint.relationship {
            Relationship::Eq => (lhs - value).abs() < 1e-6,
            Relationship::Leq => lhs <= value + 1e-6,
            Relationship::Geq => lhs >= value - 1e-6,
        }
    }

    fn inside_polygon(constraints: &[Constraint], p: f64, q: f64) -> bool {
        constraints.iter().all(|constraint| satisfies(constraint, p, q))
    }

    #[test]
    fn test_segment_count() {
        let constraints = apparent_power_constraints(
            DeviceId(0),
            Phase::All,
            ConstraintKind::Cycle,
            10_000.0,
            2,
        );
        assert_eq!(constraints.len(), 8);
    }

    #[test]
    fn test_origin_is_always_inside() {
        for segments in 1..=6 {
            let constraints = apparent_power_constraints(
                DeviceId(0),
                Phase::All,
                ConstraintKind::Cycle,
                5_000.0,
                segments,
            );
            assert!(inside_polygon(&constraints, 0.0, 0.0));
        }
    }

    #[test]
    fn test_vertices_lie_on_the_circle() {
        let limit = 5_000.0;
        let constraints =
            apparent_power_constraints(DeviceId(0), Phase::All, ConstraintKind::Cycle, limit, 2);
        for i in 0..8 {
            let angle = TAU * i as f64 / 8.0;
            let (p, q) = (limit * angle.cos(), limit * angle.sin());
            assert!(
                inside_polygon(&constraints, p, q),
                "vertex {i} at ({p:.1}, {q:.1}) should be feasible"
            );
        }
    }

    #[test]
    fn test_points_outside_circle_are_cut() {
        let limit = 5_000.0;
        let constraints =
            apparent_power_constraints(DeviceId(0), Phase::All, ConstraintKind::Cycle, limit, 2);
        for i in 0..16 {
            let angle = TAU * i as f64 / 16.0 + 0.05;
            let radius = limit * 1.05;
            let (p, q) = (radius * angle.cos(), radius * angle.sin());
            assert!(
                !inside_polygon(&constraints, p, q),
                "({p:.1}, {q:.1}) is outside the circle and must violate a chord"
            );
        }
    }

    #[test]
    fn test_non_positive_limit_degrades_to_zero() {
        let constraints =
            apparent_power_constraints(DeviceId(3), Phase::L2, ConstraintKind::Static, -1.0, 2);
        assert_eq!(constraints.len(), 2);
        assert!(inside_polygon(&constraints, 0.0, 0.0));
        assert!(!inside_polygon(&constraints, 100.0, 0.0));
        assert!(!inside_polygon(&constraints, 0.0, -100.0));
    }

    proptest! {
        /// The polygon is inscribed: every feasible point stays within the
        /// circle, and points within the polygon's inradius are feasible.
        #[test]
        fn prop_polygon_inscribed(
            segments in 1u32..6,
            angle in 0.0..TAU,
            radius_fraction in 0.0..1.0f64,
        ) {
            let limit = 8_000.0;
            let constraints = apparent_power_constraints(
                DeviceId(0),
                Phase::All,
                ConstraintKind::Cycle,
                limit,
                segments,
            );

            let points = 4.0 * f64::from(segments);
            let inradius = limit * (std::f64::consts::PI / points).cos();

            // Inside the inradius: always feasible.
            let r_in = radius_fraction * inradius * 0.999;
            prop_assert!(inside_polygon(&constraints, r_in * angle.cos(), r_in * angle.sin()));

            // Outside the circle: never feasible.
            let r_out = limit * (1.001 + radius_fraction);
            prop_assert!(!inside_polygon(&constraints, r_out * angle.cos(), r_out * angle.sin()));
        }
    }
}
