// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;

use super::*;

fn irregular_axis() -> Axis {
    // Cells: [0, 1], [1, 3], [3, 3.5], [3.5, 6]
    Axis::irregular(&[0.5, 2.0, 3.25, 4.75], &[1.0, 2.0, 0.5, 2.5]).unwrap()
}

#[test]
fn test_regular_axis_boundaries() {
    let axis = Axis::regular(100.0, 10.0, 4).unwrap();
    assert_eq!(axis.size(), 4);
    assert!(axis.is_regular());
    assert_abs_diff_eq!(axis.lower(0), 100.0);
    assert_abs_diff_eq!(axis.upper(0), 110.0);
    assert_abs_diff_eq!(axis.center(2), 125.0);
    assert_abs_diff_eq!(axis.width(3), 10.0);
    assert_eq!(axis.range(), Interval::new(100.0, 140.0));
}

#[test]
fn test_invalid_axes() {
    assert_eq!(Axis::regular(0.0, 1.0, 0), Err(GridError::EmptyAxis));
    assert!(matches!(
        Axis::regular(0.0, -1.0, 3),
        Err(GridError::InvalidWidth { .. })
    ));
    assert!(matches!(
        Axis::irregular(&[0.5, 1.5], &[1.0]),
        Err(GridError::LengthMismatch {
            centers: 2,
            widths: 1
        })
    ));
    // A gap between the first and second cells.
    assert!(matches!(
        Axis::irregular(&[0.5, 3.0], &[1.0, 1.0]),
        Err(GridError::NotContiguous { index: 1 })
    ));
}

#[test]
fn test_locate_contains_value() {
    for axis in [Axis::regular(-3.0, 0.7, 13).unwrap(), irregular_axis()] {
        let range = axis.range();
        let n = 997;
        for k in 0..=n {
            let x = range.start + (range.end - range.start) * k as f64 / n as f64;
            for bias_right in [false, true] {
                let i = axis.locate(x, bias_right, 0).unwrap();
                assert!(axis.lower(i) <= x || near(axis.lower(i), x), "x={x}, i={i}");
                assert!(x <= axis.upper(i) || near(axis.upper(i), x), "x={x}, i={i}");
            }
        }
    }
}

#[test]
fn test_locate_boundary_bias() {
    let axis = Axis::regular(0.0, 0.1, 10).unwrap();
    assert_eq!(axis.locate(0.3, true, 0), Ok(3));
    assert_eq!(axis.locate(0.3, false, 0), Ok(2));
    assert_eq!(axis.locate(0.0, false, 0), Ok(0));
    assert_eq!(axis.locate(1.0, true, 0), Ok(9));

    let axis = irregular_axis();
    assert_eq!(axis.locate(3.0, true, 0), Ok(2));
    assert_eq!(axis.locate(3.0, false, 0), Ok(1));
    // The hint doesn't change the answer.
    assert_eq!(axis.locate(3.2, true, 3), Ok(2));
    assert_eq!(axis.locate(5.9, false, 1), Ok(3));
}

#[test]
fn test_locate_out_of_range() {
    let axis = Axis::regular(0.0, 1.0, 4).unwrap();
    assert!(matches!(
        axis.locate(-0.5, true, 0),
        Err(GridError::OutOfRange { .. })
    ));
    assert!(matches!(
        axis.locate(4.5, false, 0),
        Err(GridError::OutOfRange { .. })
    ));
    assert!(axis.locate(f64::NAN, false, 0).is_err());
}

#[test]
fn test_subset() {
    let axis = Axis::regular(0.0, 2.0, 5).unwrap();
    let sub = axis.subset(1, 3).unwrap();
    assert_eq!(sub.size(), 3);
    assert_abs_diff_eq!(sub.lower(0), 2.0);
    assert_abs_diff_eq!(sub.upper(2), 8.0);

    let sub = irregular_axis().subset(1, 2).unwrap();
    assert_eq!(sub.range(), Interval::new(1.0, 3.5));

    assert_eq!(axis.subset(2, 5), Err(GridError::Index { index: 5, size: 5 }));
    assert_eq!(
        axis.subset(3, 1),
        Err(GridError::InvertedSubset { first: 3, last: 1 })
    );
}

#[test]
fn test_compress() {
    let axis = Axis::regular(0.0, 1.0, 6).unwrap();
    let c = axis.compress(3).unwrap();
    assert_eq!(c.size(), 2);
    assert_abs_diff_eq!(c.width(0), 3.0);
    assert_eq!(c.range(), axis.range());

    assert_eq!(
        axis.compress(4),
        Err(GridError::UnevenCompression {
            size: 6,
            factor: 4,
            dropped: 2
        })
    );
    let (c, dropped) = axis.compress_truncating(4).unwrap();
    assert_eq!(c.size(), 1);
    assert_eq!(dropped, 2);

    assert_eq!(axis.compress(0), Err(GridError::ZeroCompression));
    assert_eq!(
        axis.compress_truncating(7),
        Err(GridError::CompressionTooLarge { size: 6, factor: 7 })
    );

    let c = irregular_axis().compress(2).unwrap();
    assert!(!c.is_regular());
    assert_eq!(c.size(), 2);
    assert_eq!(c.range(), Interval::new(0.0, 6.0));
    assert_abs_diff_eq!(c.upper(0), 3.0);
}

#[test]
fn test_grid_subset_and_locate() {
    let grid = Grid::new(
        Axis::regular(100e6, 1e6, 8).unwrap(),
        Axis::regular(0.0, 10.0, 4).unwrap(),
    );
    assert_eq!(grid.shape(), (8, 4));
    assert_eq!(grid.num_cells(), 32);

    let sub = grid
        .subset(Location::new(2, 1), Location::new(3, 3))
        .unwrap();
    assert_eq!(sub.shape(), (2, 3));
    assert_abs_diff_eq!(sub.freq().lower(0), 102e6);
    assert_abs_diff_eq!(sub.time().lower(0), 10.0);

    assert_eq!(grid.locate(103.5e6, 25.0), Ok(Location::new(3, 2)));
    assert!(grid.subset(Location::new(0, 0), Location::new(8, 0)).is_err());
}

#[test]
fn test_range2() {
    let r = Range2::new(Location::new(1, 2), Location::new(2, 3));
    assert_eq!(r.count(), 4);
    let locs: Vec<Location> = r.iter().collect();
    assert_eq!(
        locs,
        vec![
            Location::new(1, 2),
            Location::new(2, 2),
            Location::new(1, 3),
            Location::new(2, 3)
        ]
    );
    assert_eq!(r.linear_index(Location::new(2, 3)), 3);
    assert_eq!(Range2::EMPTY.count(), 0);
    assert_eq!(Range2::EMPTY.iter().count(), 0);

    let other = Range2::new(Location::new(3, 0), Location::new(5, 5));
    assert!(r.intersect(&other).is_empty());
}

#[test]
fn test_axis_serde() {
    let axis = irregular_axis();
    let json = serde_json::to_string(&axis).unwrap();
    let back: Axis = serde_json::from_str(&json).unwrap();
    assert_eq!(back.size(), axis.size());
    assert_abs_diff_eq!(back.upper(3), 6.0);

    let bad: Result<Axis, _> = serde_json::from_str(r#"{"type":"regular","start":0.0,"width":1.0,"count":0}"#);
    assert!(bad.is_err());
}
