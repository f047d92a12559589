use ndvox::{ArrayStore, Sample, Scalar, ScalarKind, View, ViewMut};

use quickcheck::{quickcheck, TestResult};

#[test]
fn store_allocates_every_representable_kind()
{
    for kind in ScalarKind::ALL {
        let r = ArrayStore::zeros(&[2, 3], kind);
        assert_eq!(r.is_ok(), kind.representable(), "{:?}", kind);
        if let Ok(s) = r {
            assert_eq!(s.bytes(), 6 * kind.size_of());
            // zero-initialized
            assert_eq!(s.sample(0).as_f64(), 0.);
        }
    }
}

#[test]
fn typed_view_equals_raw_cast()
{
    // write i16 values, check that f64 and i64 views agree with a
    // direct cast of the raw element, at every index
    let vals: Vec<i16> = (0..24).map(|v| (v * 7 - 40) as i16).collect();
    let store = ArrayStore::from_elems(&[2, 3, 4], &vals).unwrap();
    let vf = View::<f64>::new(&store).unwrap();
    let vi = View::<i64>::new(&store).unwrap();
    for x in 0..2 {
        for y in 0..3 {
            for z in 0..4 {
                let flat = store.linear_index(&[x, y, z]);
                assert_eq!(vf.get_nd(&[x, y, z]), vals[flat] as f64);
                assert_eq!(vi.get(flat), vals[flat] as i64);
            }
        }
    }
}

quickcheck! {
    fn view_cast_round_trip(vals: Vec<i32>) -> TestResult
    {
        if vals.is_empty() || vals.len() > 4096 {
            return TestResult::discard();
        }
        let store = ArrayStore::from_elems(&[vals.len()], &vals).unwrap();
        let view = View::<f64>::new(&store).unwrap();
        for (i, &v) in vals.iter().enumerate() {
            if view.get(i) != v as f64 {
                return TestResult::failed();
            }
        }
        TestResult::passed()
    }

    fn linear_index_matches_strides(x: u8, y: u8, z: u8) -> TestResult
    {
        let dim = [(x % 5 + 1) as usize, (y % 5 + 1) as usize, (z % 5 + 1) as usize];
        let store = ArrayStore::zeros(&dim, ScalarKind::UInt8).unwrap();
        let idx = [dim[0] - 1, dim[1] / 2, dim[2] - 1];
        let want = idx[0] * dim[1] * dim[2] + idx[1] * dim[2] + idx[2];
        TestResult::from_bool(store.linear_index(&idx) == want)
    }
}

#[test]
fn cross_kind_write_reads_back_casted()
{
    let mut store = ArrayStore::zeros(&[8], ScalarKind::Int16).unwrap();
    {
        let mut vm = ViewMut::<f64>::new(&mut store).unwrap();
        vm.set(0, 3.7);
        vm.set(1, -3.7);
        vm.set(2, 40000.0); // saturates at i16::MAX
    }
    assert_eq!(store.sample(0).as_i64(), 3);
    assert_eq!(store.sample(1).as_i64(), -3);
    assert_eq!(store.sample(2).as_i64(), i16::MAX as i64);
}

#[test]
fn complex_store_through_real_view_takes_real_part()
{
    use num_complex::Complex64;
    let vals = [Complex64::new(1.5, 9.), Complex64::new(-2.5, -1.)];
    let store = ArrayStore::from_elems(&[2], &vals).unwrap();
    let v = View::<f64>::new(&store).unwrap();
    assert_eq!(v.get(0), 1.5);
    assert_eq!(v.get(1), -2.5);
    let vc = View::<Complex64>::new(&store).unwrap();
    assert_eq!(vc.get(1), vals[1]);
}

#[test]
fn copy_cast_extends_with_default()
{
    let vals: Vec<u8> = (1..=6).collect();
    let store = ArrayStore::from_elems(&[2, 3], &vals).unwrap();
    let big = store.copy_cast(&[3, 3], ScalarKind::Float32).unwrap();
    // third row is the zero extension
    for c in 0..3 {
        assert_eq!(big.sample(big.linear_index(&[2, c])).as_f64(), 0.);
    }
    assert_eq!(big.sample(big.linear_index(&[1, 2])).as_f64(), 6.);
}

#[test]
fn sample_round_trips_preserve_u64()
{
    let vals = [u64::MAX, u64::MAX - 12345, 0, 1 << 60];
    let store = ArrayStore::from_elems(&[4], &vals).unwrap();
    let copy = store.copy_cast(&[4], ScalarKind::UInt64).unwrap();
    for (i, &v) in vals.iter().enumerate() {
        assert_eq!(u64::from_sample(copy.sample(i)), v);
    }
}
