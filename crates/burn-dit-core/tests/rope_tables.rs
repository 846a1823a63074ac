//! End-to-end checks of the table builder on mixed region layouts.

use burn_dit_core::{
    AxisKind, AxisLayout, Coordinate, Frequency, PairSpan, PositionAxis, Region, RopeLayout,
};

const EPSILON: f32 = 1e-6;

fn assert_approx_eq(expected: f64, actual: f32, name: &str) {
    let diff = (expected as f32 - actual).abs();
    assert!(
        diff < EPSILON,
        "{}: expected {}, got {} (diff: {})",
        name,
        expected,
        actual,
        diff
    );
}

// ============================================================================
// Region layout
// ============================================================================

fn three_axis(channels: usize) -> AxisLayout {
    AxisLayout::aligned(
        channels,
        Frequency::Inverse { base: 10_000.0 },
        &[
            (AxisKind::Temporal, channels / 8),
            (AxisKind::Vertical, channels * 7 / 16),
            (AxisKind::Horizontal, channels * 7 / 16),
        ],
    )
    .unwrap()
}

#[test]
fn regions_are_written_in_order() {
    let layout = RopeLayout::new(
        three_axis(64),
        vec![
            Region::sequence(
                "tokens",
                2,
                vec![Coordinate::index(), Coordinate::zero(), Coordinate::zero()],
            ),
            Region::image(
                "image",
                2,
                3,
                vec![
                    Coordinate::constant(5.0),
                    Coordinate::row(),
                    Coordinate::column(),
                ],
            ),
        ],
    );
    let table = layout.build().unwrap();
    assert_eq!(table.sequence_len(), 8);

    // token 1: temporal pair 0 rotated by 1 rad
    assert_approx_eq(1f64.cos(), table.get(1, 0, 0), "token temporal cos");
    assert_approx_eq(1f64.sin(), table.get(1, 0, 1), "token temporal sin");

    // image position (1, 2) starts at sequence index 2 + 5
    let p = 7;
    assert_approx_eq(5f64.cos(), table.get(p, 0, 0), "image temporal");
    // vertical span starts at pair 4, horizontal at pair 4 + 14
    assert_approx_eq(1f64.cos(), table.get(p, 0, 8), "image row");
    assert_approx_eq(2f64.cos(), table.get(p, 0, 36), "image column");
}

#[test]
fn region_lengths_sum_to_sequence() {
    let regions = vec![
        Region::grid("video", 3, 4, 5, vec![Coordinate::frame(); 3]),
        Region::sequence("tokens", 17, vec![Coordinate::index(); 3]),
        Region::padding(7, 3),
    ];
    let layout = RopeLayout::new(three_axis(32), regions);
    let ranges = layout.region_ranges();
    assert_eq!(ranges, vec![0..60, 60..77, 77..84]);
    assert_eq!(layout.build().unwrap().sequence_len(), 84);
}

// ============================================================================
// Interleaved axes
// ============================================================================

#[test]
fn interleaved_axes_with_identity_padding() {
    // 2 padding pairs, then 2 pairs each for t/y/x interleaved
    let f = Frequency::FractionalPi { base: 10_000.0 };
    let axes = AxisLayout::new(
        16,
        vec![
            PositionAxis::new(AxisKind::Constant, f, PairSpan::contiguous(0, 2)),
            PositionAxis::new(AxisKind::Temporal, f, PairSpan::strided(2, 2, 3)),
            PositionAxis::new(AxisKind::Vertical, f, PairSpan::strided(3, 2, 3)),
            PositionAxis::new(AxisKind::Horizontal, f, PairSpan::strided(4, 2, 3)),
        ],
    )
    .unwrap();
    let region = Region::image(
        "video",
        2,
        2,
        vec![
            Coordinate::zero(),
            Coordinate::constant(0.25),
            Coordinate::row().scaled(0.5),
            Coordinate::column().shifted(-1.0),
        ],
    );
    let table = RopeLayout::new(axes, vec![region]).build().unwrap();

    for p in 0..4 {
        assert_eq!(table.pair(p, 0, 0), (1.0, 0.0));
        assert_eq!(table.pair(p, 0, 1), (1.0, 0.0));
    }

    // position (1, 0): second temporal frequency is base * π/2
    let freq = 10_000.0 * std::f64::consts::FRAC_PI_2;
    let (cos, _) = table.pair(2, 0, 5);
    assert_approx_eq((0.25 * freq).cos(), cos, "temporal pair 1");
    // vertical pair 0 sits at pair 3
    let (_, sin) = table.pair(2, 0, 3);
    assert_approx_eq((0.5 * std::f64::consts::FRAC_PI_2).sin(), sin, "vertical pair 0");
    // horizontal coordinate is -1 at column 0
    let (_, sin) = table.pair(2, 0, 4);
    assert_approx_eq((-std::f64::consts::FRAC_PI_2).sin(), sin, "horizontal pair 0");
}
