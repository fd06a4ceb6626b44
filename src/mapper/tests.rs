// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::*;

fn obs_grid() -> Grid {
    // 8 channels of 1 MHz from 100 MHz, 6 timesteps of 10 s.
    Grid::new(
        Axis::regular(100e6, 1e6, 8).unwrap(),
        Axis::regular(0.0, 10.0, 6).unwrap(),
    )
}

#[test]
fn test_contained_range_exact_boundaries() {
    let axis = Axis::regular(0.0, 1.0, 10).unwrap();
    assert_eq!(
        find_contained_cell_range(&axis, Interval::new(2.0, 5.0)),
        Interval::new(2, 4)
    );
    // Partially covered boundary cells are excluded.
    assert_eq!(
        find_contained_cell_range(&axis, Interval::new(1.5, 5.5)),
        Interval::new(2, 4)
    );
    // Intervals bigger than the axis give the whole axis.
    assert_eq!(
        find_contained_cell_range(&axis, Interval::new(-100.0, 100.0)),
        Interval::new(0, 9)
    );
    assert_eq!(
        find_contained_cell_range(&axis, Interval::new(f64::NEG_INFINITY, f64::INFINITY)),
        Interval::new(0, 9)
    );
    // Boundaries that are only numerically coincident still count.
    assert_eq!(
        find_contained_cell_range(&axis, Interval::new(0.1 + 0.2 - 0.3 + 3.0, 4.0)),
        Interval::new(3, 3)
    );
}

#[test]
fn test_contained_range_empty() {
    let axis = Axis::regular(0.0, 1.0, 10).unwrap();
    // Zero and negative widths.
    assert!(find_contained_cell_range(&axis, Interval::new(3.0, 3.0)).is_empty());
    assert!(find_contained_cell_range(&axis, Interval::new(4.0, 3.0)).is_empty());
    // No overlap.
    assert!(find_contained_cell_range(&axis, Interval::new(20.0, 30.0)).is_empty());
    // Overlap, but no complete cell.
    assert!(find_contained_cell_range(&axis, Interval::new(3.2, 3.8)).is_empty());
    assert!(find_contained_cell_range(&axis, Interval::new(3.5, 4.5)).is_empty());
}

#[test]
fn test_contained_range_cells_are_inside() {
    let axis = Axis::irregular(&[0.5, 2.0, 3.25, 4.75], &[1.0, 2.0, 0.5, 2.5]).unwrap();
    let bounds = [-1.0, 0.0, 0.4, 1.0, 2.5, 3.0, 3.5, 5.0, 6.0, 7.0];
    for &a in &bounds {
        for &b in &bounds {
            let interval = Interval::new(a, b);
            let r = find_contained_cell_range(&axis, interval);
            if b - a <= 0.0 {
                assert!(r.is_empty());
            }
            for i in r.iter() {
                assert!(axis.lower(i) >= a || near(axis.lower(i), a));
                assert!(axis.upper(i) <= b || near(axis.upper(i), b));
            }
        }
    }
}

#[test]
fn test_identity_cell_map() {
    let grid = obs_grid();
    let mapper = GridMapper::new(grid.clone(), Box2::unbounded(), grid.clone());
    assert!(!mapper.is_intersection_empty());
    assert_eq!(mapper.eval_grid(), Some(&grid));
    assert_eq!(mapper.eval_offset(), Location::new(0, 0));
    assert_eq!(mapper.freq_map().index, (0..8).collect::<Vec<_>>());
    assert_eq!(mapper.time_map().index, (0..6).collect::<Vec<_>>());
    assert_eq!(mapper.selected_cell_count(), 48);
}

#[test]
fn test_coarse_solution_grid() {
    let grid = obs_grid();
    // Solution cells of 4 channels by 3 timesteps.
    let sol = Grid::new(
        grid.freq().compress(4).unwrap(),
        grid.time().compress(3).unwrap(),
    );
    let mut mapper = GridMapper::new(grid, Box2::unbounded(), sol);
    assert_eq!(mapper.freq_map().index, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    assert_eq!(mapper.time_map().index, vec![0, 0, 0, 1, 1, 1]);
    assert_eq!(
        mapper.eval_cells(),
        Range2::new(Location::new(0, 0), Location::new(1, 1))
    );

    mapper.set_cell_selection(Location::new(1, 1), Location::new(1, 1));
    let sel = mapper.selection();
    assert_eq!(sel.count(), 1);
    assert_eq!(sel.eval, Range2::new(Location::new(4, 3), Location::new(7, 5)));
    assert_eq!(sel.obs, sel.eval);
    assert_eq!(
        mapper.solution_cell(Location::new(5, 4)),
        Some(Location::new(1, 1))
    );
    assert_eq!(
        mapper.solution_cell(Location::new(2, 1)),
        Some(Location::new(0, 0))
    );
    assert_eq!(mapper.request_grid().unwrap().shape(), (4, 3));
}

#[test]
fn test_model_domain_restricts_eval_grid() {
    let grid = obs_grid();
    // The model is only valid from 101.5 MHz to 106 MHz, and from 10 s
    // onwards.
    let domain = Box2::new(Interval::new(101.5e6, 106e6), Interval::new(10.0, 1e9));
    let sol = Grid::new(
        Axis::regular(100e6, 2e6, 4).unwrap(),
        Axis::regular(0.0, 30.0, 2).unwrap(),
    );
    let mapper = GridMapper::new(grid, domain, sol);
    let eval = mapper.eval_grid().unwrap();
    // Channels 2..=5 and timesteps 1..=5.
    assert_eq!(eval.shape(), (4, 5));
    assert_eq!(mapper.eval_offset(), Location::new(2, 1));
    // Eval channels 0,1 -> solution cell 1; 2,3 -> solution cell 2.
    assert_eq!(mapper.freq_map().target, Interval::new(1, 2));
    assert_eq!(mapper.freq_map().index, vec![0, 0, 1, 1]);

    let sel = mapper.selection();
    assert_eq!(sel.solution, Range2::new(Location::new(1, 0), Location::new(2, 1)));
    assert_eq!(sel.obs, Range2::new(Location::new(2, 1), Location::new(5, 5)));
    // Channel 1 is outside the model domain.
    assert_eq!(mapper.solution_cell(Location::new(1, 3)), None);
}

#[test]
fn test_selection_outside_eval_cells_is_empty() {
    let grid = obs_grid();
    let sol = Grid::new(
        Axis::regular(0.0, 1e9, 1).unwrap(),
        Axis::regular(0.0, 10.0, 20).unwrap(),
    );
    let mut mapper = GridMapper::new(grid, Box2::unbounded(), sol);
    assert_eq!(
        mapper.eval_cells(),
        Range2::new(Location::new(0, 0), Location::new(0, 5))
    );

    mapper.set_cell_selection(Location::new(0, 10), Location::new(0, 19));
    assert!(mapper.is_selection_empty());
    assert_eq!(mapper.selected_cell_count(), 0);
    assert_eq!(*mapper.selection(), CellSelection::EMPTY);
    assert!(mapper.request_grid().is_none());

    // Partially outside: clipped.
    mapper.set_cell_selection(Location::new(0, 4), Location::new(0, 12));
    assert_eq!(mapper.selected_cell_count(), 2);
    assert_eq!(mapper.selection().relative.time, Interval::new(4, 5));
}

#[test]
fn test_disjoint_domain() {
    let grid = obs_grid();
    let domain = Box2::new(Interval::new(200e6, 300e6), Interval::new(0.0, 60.0));
    let mapper = GridMapper::new(grid.clone(), domain, grid);
    assert!(mapper.is_intersection_empty());
    assert!(mapper.eval_grid().is_none());
    assert!(mapper.is_selection_empty());
}
