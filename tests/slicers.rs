use ndvox::{BoundaryPolicy, KSlicer, Slicer};

use quickcheck::{quickcheck, TestResult};
use std::collections::HashSet;

#[test]
fn full_traversal_covers_each_offset_once()
{
    let s = Slicer::new(&[3, 4, 5]).unwrap();
    let offs: Vec<usize> = s.collect();
    assert_eq!(offs.len(), 60);
    let set: HashSet<usize> = offs.iter().copied().collect();
    assert_eq!(set.len(), 60);
}

#[test]
fn named_axis_is_fastest()
{
    let mut s = Slicer::new(&[3, 4]).unwrap();
    s.set_order(&[0], false).unwrap();
    let offs: Vec<usize> = s.collect();
    // along axis 0 the stride is 4: first steps move by 4
    assert_eq!(offs[0], 0);
    assert_eq!(offs[1], 4);
    assert_eq!(offs[2], 8);
    assert_eq!(offs[3], 1);
}

quickcheck! {
    fn roi_iteration_is_exact_and_unique(a: u8, b: u8, c: u8) -> TestResult
    {
        let dim = [(a % 6 + 2) as usize, (b % 6 + 2) as usize, (c % 6 + 2) as usize];
        let roi = [
            (1usize, dim[0] - 1),
            (0usize, dim[1] / 2),
            (1usize, dim[2] - 1),
        ];
        let mut s = Slicer::new(&dim).unwrap();
        s.set_roi(&roi).unwrap();
        let offs: Vec<usize> = s.collect();
        let want: usize = roi.iter().map(|&(lo, hi)| hi - lo + 1).product();
        if offs.len() != want {
            return TestResult::failed();
        }
        let uniq: HashSet<usize> = offs.iter().copied().collect();
        TestResult::from_bool(uniq.len() == want)
    }

    fn any_order_is_a_permutation(ord: Vec<usize>) -> TestResult
    {
        let dim = [3usize, 4, 2];
        let order: Vec<usize> = ord.into_iter().filter(|&d| d < 3).take(3).fold(
            Vec::new(),
            |mut acc, d| {
                if !acc.contains(&d) {
                    acc.push(d);
                }
                acc
            },
        );
        let mut s = Slicer::new(&dim).unwrap();
        s.set_order(&order, false).unwrap();
        let offs: Vec<usize> = s.collect();
        let uniq: HashSet<usize> = offs.iter().copied().collect();
        TestResult::from_bool(offs.len() == 24 && uniq.len() == 24)
    }
}

#[test]
fn kslicer_boundary_offsets_respect_policies()
{
    // every clamped kernel offset must be resolvable under each
    // boundary policy without leaving the array
    let dim = [4usize, 4];
    let mut k = KSlicer::new(&dim).unwrap();
    k.set_radius(2).unwrap();
    k.go_begin();
    loop {
        for i in 0..k.ksize() {
            let (off, outside) = k.offset(i);
            assert!(off < 16, "offset {} escaped the array", off);

            let raw = k.offset_index(i, false);
            for (d, &len) in dim.iter().enumerate() {
                for policy in [BoundaryPolicy::ZeroFlux, BoundaryPolicy::Wrap, BoundaryPolicy::ConstZero] {
                    let resolved = policy.resolve(raw[d], len);
                    match policy {
                        BoundaryPolicy::ConstZero => {
                            if resolved.is_none() {
                                assert!(outside || raw[d] < 0 || raw[d] >= len as i64);
                            }
                        }
                        _ => {
                            let r = resolved.unwrap();
                            assert!(r < len);
                        }
                    }
                }
            }
        }
        if k.advance().is_none() {
            break;
        }
    }
}

#[test]
fn kslicer_center_tracks_slicer()
{
    let mut k = KSlicer::new(&[3, 3]).unwrap();
    k.set_radius(1).unwrap();
    let mut s = Slicer::new(&[3, 3]).unwrap();
    loop {
        assert_eq!(k.center(), s.flat());
        assert_eq!(k.center_index(), s.pos());
        let a = k.advance();
        let b = s.advance();
        assert_eq!(a, b);
        if a.is_none() {
            break;
        }
    }
}

#[test]
fn step_and_offset_against_known_grid()
{
    let mut s = Slicer::new(&[5, 5]).unwrap();
    s.go_index(&[2, 2]).unwrap();
    let (flat, outside) = s.offset(&[1, -2]);
    assert!(!outside);
    assert_eq!(flat, 3 * 5);
    let (flat, outside) = s.offset(&[3, 0]);
    assert!(outside); // clamped to the array edge
    assert_eq!(flat, 4 * 5 + 2);
}
