use nalgebra::DVector;
use ndvox::metric::Metric;
use ndvox::register::{cor_deriv_test, distortion_deriv_test, info_deriv_test};
use ndvox::{InfoKind, OrientedImage, RigidInfoMetric, ScalarKind, View, ViewMut};

/// A smooth blob plus a gentle ramp, so gradients are informative
/// everywhere and interpolation error stays small.
fn smooth_volume(dim: usize, cx: f64, cy: f64, cz: f64) -> OrientedImage
{
    let mut img = OrientedImage::zeros(&[dim, dim, dim], ScalarKind::Float64).unwrap();
    {
        let mut vm = ViewMut::<f64>::new(img.store_mut()).unwrap();
        let sigma = dim as f64 / 4.;
        for x in 0..dim {
            for y in 0..dim {
                for z in 0..dim {
                    let d2 =
                        (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) + (z as f64 - cz).powi(2);
                    let bump = (-d2 / (2. * sigma * sigma)).exp();
                    let ramp = 0.02 * (x as f64 + 2. * y as f64);
                    vm.set_nd(&[x, y, z], bump + ramp);
                }
            }
        }
    }
    img
}

/// The correlation metric's analytic gradient against centered finite
/// differences (the cor3DDerivTest contract).
#[test]
fn correlation_gradient_matches_finite_differences()
{
    let fixed = smooth_volume(16, 8.0, 7.5, 7.5);
    let moving = smooth_volume(16, 7.5, 7.5, 8.0);
    let ok = cor_deriv_test(1e-3, 0.25, &fixed, &moving).unwrap();
    assert!(ok, "correlation gradient disagrees with finite differences");
}

#[test]
fn information_gradient_matches_finite_differences()
{
    let fixed = smooth_volume(16, 8.0, 7.5, 7.5);
    let moving = smooth_volume(16, 7.5, 8.0, 7.5);
    for kind in [
        InfoKind::MutualInformation,
        InfoKind::NormalizedMutualInformation,
        InfoKind::VariationOfInformation,
    ] {
        let ok = info_deriv_test(1e-3, 0.3, &fixed, &moving, kind).unwrap();
        assert!(ok, "{:?} gradient disagrees with finite differences", kind);
    }
}

#[test]
fn distortion_gradient_matches_finite_differences()
{
    let fixed = smooth_volume(10, 5.0, 4.5, 4.5);
    let moving = smooth_volume(10, 4.5, 5.0, 4.5);
    let ok = distortion_deriv_test(1e-4, 0.3, &fixed, &moving, 4.0).unwrap();
    assert!(ok, "distortion gradient disagrees with finite differences");
}

/// Parzen-window MI must agree with the brute-force histogram
/// definition to within the kernel's smoothing.
#[test]
fn mi_agrees_with_brute_force_histogram()
{
    let fixed = smooth_volume(14, 7.0, 6.5, 6.5);
    let moving = smooth_volume(14, 6.5, 7.0, 6.5);

    let bins = 32usize;
    let krad = 2usize;
    let mut metric = RigidInfoMetric::new(&fixed, &moving, InfoKind::MutualInformation, false).unwrap();
    metric.set_bins(bins, krad).unwrap();
    let parzen = metric.value(&DVector::zeros(6)).unwrap();

    // plain nearest-bin joint histogram over the same data
    let fv = View::<f64>::new(fixed.store()).unwrap();
    let mv = View::<f64>::new(moving.store()).unwrap();
    let n = fixed.elements();
    let range = |v: &View<f64>| {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for i in 0..n {
            lo = lo.min(v.get(i));
            hi = hi.max(v.get(i));
        }
        (lo, hi)
    };
    let (flo, fhi) = range(&fv);
    let (mlo, mhi) = range(&mv);
    let nb = bins - 2 * krad - 1;
    let mut joint = vec![0f64; nb * nb];
    for i in 0..n {
        let bf = (((fv.get(i) - flo) / (fhi - flo) * nb as f64) as usize).min(nb - 1);
        let bm = (((mv.get(i) - mlo) / (mhi - mlo) * nb as f64) as usize).min(nb - 1);
        joint[bf * nb + bm] += 1.;
    }
    for v in &mut joint {
        *v /= n as f64;
    }
    let mut pf = vec![0f64; nb];
    let mut pm = vec![0f64; nb];
    for i in 0..nb {
        for j in 0..nb {
            pf[i] += joint[i * nb + j];
            pm[j] += joint[i * nb + j];
        }
    }
    let ent = |p: &[f64]| -p.iter().filter(|&&v| v > 0.).map(|&v| v * v.ln()).sum::<f64>();
    let brute = ent(&pf) + ent(&pm) - ent(&joint);

    assert!(
        (parzen - brute).abs() < 0.5,
        "parzen MI {} vs brute-force {}",
        parzen,
        brute
    );
}
