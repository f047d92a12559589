use nalgebra::DMatrix;
use ndvox::{
    ErrorKind, MatrixReorg, MemorySource, OrientedImage, ReorgConfig, ScalarKind, View, ViewMut,
    VolumeSource,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

fn random_volume(rng: &mut StdRng, dim: &[usize]) -> OrientedImage
{
    let mut img = OrientedImage::zeros(dim, ScalarKind::Float64).unwrap();
    let n = img.elements();
    {
        let mut vm = ViewMut::<f64>::new(img.store_mut()).unwrap();
        for i in 0..n {
            vm.set(i, rng.random::<f64>() * 10. - 5.);
        }
    }
    img
}

fn checker_mask(dim: &[usize], keep_mod: usize) -> OrientedImage
{
    let mut img = OrientedImage::zeros(dim, ScalarKind::UInt8).unwrap();
    let n = img.elements();
    {
        let mut vm = ViewMut::<u8>::new(img.store_mut()).unwrap();
        for i in 0..n {
            vm.set(i, (i % keep_mod != 0) as u8);
        }
    }
    img
}

/// Build a T x S grid of random 4-D volumes plus masks in a memory
/// source; returns the source, configured paths and the brute-force
/// full matrix.
fn grid_setup(
    rng: &mut StdRng, t_blocks: usize, s_blocks: usize, dim: [usize; 4],
) -> (MemorySource, ReorgConfig, DMatrix<f64>)
{
    let source = MemorySource::new();
    let mut image_paths = Vec::new();
    let mut mask_paths = Vec::new();
    let spatial = dim[0] * dim[1] * dim[2];
    let tlen = dim[3];

    let mut masks = Vec::new();
    for sb in 0..s_blocks {
        let mask = checker_mask(&dim[..3], 3 + sb);
        let path = PathBuf::from(format!("mask_{}", sb));
        source.insert(path.clone(), mask.clone());
        mask_paths.push(path);
        masks.push(mask);
    }

    let mut volumes = vec![];
    for sb in 0..s_blocks {
        for tb in 0..t_blocks {
            let img = random_volume(rng, &dim);
            let path = PathBuf::from(format!("img_{}_{}", sb, tb));
            source.insert(path.clone(), img.clone());
            image_paths.push(path);
            volumes.push(img);
        }
    }

    // brute-force matrix: rows = T * tlen, cols = masked voxels
    let total_rows = t_blocks * tlen;
    let mut cols_per_block = vec![0usize; s_blocks];
    for sb in 0..s_blocks {
        let mv = View::<f64>::new(masks[sb].store()).unwrap();
        cols_per_block[sb] = (0..spatial).filter(|&i| mv.get(i) != 0.).count();
    }
    let total_cols: usize = cols_per_block.iter().sum();
    let mut x = DMatrix::zeros(total_rows, total_cols);
    let mut col0 = 0;
    for sb in 0..s_blocks {
        let mv = View::<f64>::new(masks[sb].store()).unwrap();
        let mut cc = 0;
        for vox in 0..spatial {
            if mv.get(vox) == 0. {
                continue;
            }
            for tb in 0..t_blocks {
                let img = &volumes[sb * t_blocks + tb];
                let iv = View::<f64>::new(img.store()).unwrap();
                for t in 0..tlen {
                    x[(tb * tlen + t, col0 + cc)] = iv.get(vox * tlen + t);
                }
            }
            cc += 1;
        }
        col0 += cols_per_block[sb];
    }

    let config = ReorgConfig {
        time_blocks: t_blocks,
        space_blocks: s_blocks,
        image_paths,
        mask_paths,
        max_doubles: 0, // caller sets
        normalize: false,
    };
    (source, config, x)
}

/// The S6 scenario at reduced size: concatenating the tall chunks
/// reconstructs the masked time series, and the streamed products
/// match brute force.
#[test]
fn round_trip_and_products_match_brute_force()
{
    let mut rng = StdRng::seed_from_u64(99);
    let dim = [5usize, 4, 3, 6];
    let (source, mut config, x) = grid_setup(&mut rng, 2, 3, dim);
    let rows = x.nrows();
    // force several chunks per space block
    config.max_doubles = rows * 7;

    let dirpath = tempfile::tempdir().unwrap();
    let prefix = dirpath.path().join("run");
    let reorg = MatrixReorg::create(&source, &prefix, &config).unwrap();

    assert_eq!(reorg.rows(), rows);
    assert_eq!(reorg.cols(), x.ncols());
    assert!(reorg.nchunks() > config.space_blocks, "expected multiple chunks per block");
    for &c in reorg.chunk_cols() {
        assert!(c * rows <= config.max_doubles);
    }

    // reconstruction by horizontal concatenation
    let mut rebuilt = DMatrix::zeros(rows, x.ncols());
    let mut c0 = 0;
    for i in 0..reorg.nchunks() {
        let map = ndvox::MatMap::open(&reorg.chunk_path(i)).unwrap();
        rebuilt.columns_mut(c0, map.cols()).copy_from(&map.matrix());
        c0 += map.cols();
    }
    assert!((&rebuilt - &x).norm() < 1e-12, "chunk concatenation differs");

    // X * v and X^T * v against brute force
    let v = DMatrix::from_fn(x.ncols(), 2, |i, j| ((i * 3 + j * 7) % 13) as f64 - 6.);
    let mut got = DMatrix::zeros(rows, 2);
    reorg.post_mult(&mut got, &v, false).unwrap();
    assert!((&got - &x * &v).norm() < 1e-10);

    let w = DMatrix::from_fn(rows, 2, |i, j| ((i * 5 + j) % 11) as f64 - 5.);
    let mut got = DMatrix::zeros(x.ncols(), 2);
    reorg.post_mult(&mut got, &w, true).unwrap();
    assert!((&got - x.transpose() * &w).norm() < 1e-10);

    // the two pre-multiplication forms
    let l = DMatrix::from_fn(2, rows, |i, j| ((i + j * 2) % 7) as f64 - 3.);
    let mut got = DMatrix::zeros(2, x.ncols());
    reorg.pre_mult(&mut got, &l, false).unwrap();
    assert!((&got - &l * &x).norm() < 1e-10);

    let l = DMatrix::from_fn(2, x.ncols(), |i, j| ((i * 2 + j) % 9) as f64 - 4.);
    let mut got = DMatrix::zeros(2, rows);
    reorg.pre_mult(&mut got, &l, true).unwrap();
    assert!((&got - &l * x.transpose()).norm() < 1e-10);
}

#[test]
fn reload_rederives_the_layout()
{
    let mut rng = StdRng::seed_from_u64(3);
    let dim = [4usize, 3, 3, 4];
    let (source, mut config, x) = grid_setup(&mut rng, 2, 2, dim);
    config.max_doubles = x.nrows() * 5;

    let dirpath = tempfile::tempdir().unwrap();
    let prefix = dirpath.path().join("run");
    let built = MatrixReorg::create(&source, &prefix, &config).unwrap();
    let loaded = MatrixReorg::load(&source, &prefix).unwrap();

    assert_eq!(loaded.rows(), built.rows());
    assert_eq!(loaded.cols(), built.cols());
    assert_eq!(loaded.chunk_cols(), built.chunk_cols());
}

#[test]
fn crashed_chunk_is_detected_on_reload()
{
    let mut rng = StdRng::seed_from_u64(5);
    let dim = [4usize, 3, 3, 4];
    let (source, mut config, x) = grid_setup(&mut rng, 2, 2, dim);
    config.max_doubles = x.nrows() * 5;

    let dirpath = tempfile::tempdir().unwrap();
    let prefix = dirpath.path().join("run");
    let built = MatrixReorg::create(&source, &prefix, &config).unwrap();

    // truncate one chunk behind the header's back
    let victim = built.chunk_path(1);
    let f = std::fs::OpenOptions::new().write(true).open(&victim).unwrap();
    let len = f.metadata().unwrap().len();
    f.set_len(len - 8).unwrap();

    let err = MatrixReorg::load(&source, &prefix).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
}

#[test]
fn missing_mask_falls_back_to_variance()
{
    let mut rng = StdRng::seed_from_u64(8);
    let dim = [3usize, 3, 3, 5];
    let source = MemorySource::new();
    // one space block, no mask: voxel 0 constant, the rest random
    let mut img = random_volume(&mut rng, &dim);
    {
        let mut vm = ViewMut::<f64>::new(img.store_mut()).unwrap();
        for t in 0..5 {
            vm.set(t, 2.5);
        }
    }
    source.insert("vol", img);
    let config = ReorgConfig {
        time_blocks: 1,
        space_blocks: 1,
        image_paths: vec![PathBuf::from("vol")],
        mask_paths: vec![],
        max_doubles: 1 << 20,
        normalize: false,
    };
    let dirpath = tempfile::tempdir().unwrap();
    let reorg = MatrixReorg::create(&source, dirpath.path().join("r"), &config).unwrap();
    // 27 voxels, one of zero variance
    assert_eq!(reorg.cols(), 26);
    assert!(source.contains(&reorg.mask_path(0)));
}

#[test]
fn normalization_zscores_the_columns()
{
    let mut rng = StdRng::seed_from_u64(13);
    let dim = [3usize, 3, 2, 8];
    let (source, mut config, _) = grid_setup(&mut rng, 1, 1, dim);
    config.max_doubles = 1 << 20;
    config.normalize = true;

    let dirpath = tempfile::tempdir().unwrap();
    let prefix = dirpath.path().join("run");
    let reorg = MatrixReorg::create(&source, &prefix, &config).unwrap();
    let map = ndvox::MatMap::open(&reorg.chunk_path(0)).unwrap();
    let m = map.matrix();
    for c in 0..m.ncols() {
        let col = m.column(c);
        let mean = col.sum() / col.len() as f64;
        let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (col.len() - 1) as f64;
        assert!(mean.abs() < 1e-10, "column {} mean {}", c, mean);
        assert!((var - 1.).abs() < 1e-10, "column {} variance {}", c, var);
    }
}

#[test]
fn too_small_budget_is_rejected()
{
    let mut rng = StdRng::seed_from_u64(30);
    let dim = [3usize, 3, 2, 10];
    let (source, mut config, x) = grid_setup(&mut rng, 2, 1, dim);
    config.max_doubles = x.nrows() - 1;
    let dirpath = tempfile::tempdir().unwrap();
    let err = MatrixReorg::create(&source, dirpath.path().join("r"), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn mismatched_tlen_is_rejected()
{
    let mut rng = StdRng::seed_from_u64(44);
    let source = MemorySource::new();
    source.insert("a", random_volume(&mut rng, &[3, 3, 2, 5]));
    source.insert("b", random_volume(&mut rng, &[3, 3, 2, 6]));
    source.insert("c", random_volume(&mut rng, &[3, 3, 2, 5]));
    source.insert("d", random_volume(&mut rng, &[3, 3, 2, 5]));
    let config = ReorgConfig {
        time_blocks: 2,
        space_blocks: 2,
        image_paths: ["a", "b", "c", "d"].iter().map(PathBuf::from).collect(),
        mask_paths: vec![],
        max_doubles: 1 << 20,
        normalize: false,
    };
    let dirpath = tempfile::tempdir().unwrap();
    let err = MatrixReorg::create(&source, dirpath.path().join("r"), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
