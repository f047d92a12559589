//! Image codecs are external collaborators: the core only needs a way
//! to read and write [`OrientedImage`]s by path. File-format crates
//! implement [`VolumeSource`]; an in-memory implementation ships here
//! for tests and as a reference.
//!
//! The round-trip contract is equality of direction, spacing, origin,
//! the frequency/phase/slice dimension indices, slice timing, and
//! pixel data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Error;
use crate::image::OrientedImage;

/// Reader/writer of oriented volumes, keyed by path.
pub trait VolumeSource
{
    fn read(&self, path: &Path) -> Result<OrientedImage, Error>;

    fn write(&self, img: &OrientedImage, path: &Path) -> Result<(), Error>;
}

/// An in-memory volume store.
#[derive(Default)]
pub struct MemorySource
{
    volumes: Mutex<HashMap<PathBuf, OrientedImage>>,
}

impl MemorySource
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Pre-load a volume under a path.
    pub fn insert(&self, path: impl Into<PathBuf>, img: OrientedImage)
    {
        self.volumes.lock().unwrap().insert(path.into(), img);
    }

    pub fn contains(&self, path: &Path) -> bool
    {
        self.volumes.lock().unwrap().contains_key(path)
    }
}

impl VolumeSource for MemorySource
{
    fn read(&self, path: &Path) -> Result<OrientedImage, Error>
    {
        let map = self.volumes.lock().unwrap();
        let img = map
            .get(path)
            .ok_or_else(|| Error::runtime(format!("no such volume: {}", path.display())))?;
        // deep copy: callers may mutate their read
        let mut out = img.clone();
        out.store_mut().make_unique();
        Ok(out)
    }

    fn write(&self, img: &OrientedImage, path: &Path) -> Result<(), Error>
    {
        let mut copy = img.clone();
        copy.store_mut().make_unique();
        self.volumes.lock().unwrap().insert(path.to_path_buf(), copy);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::SliceOrder;
    use crate::kind::ScalarKind;
    use crate::view::{View, ViewMut};

    #[test]
    fn memory_source_round_trips_metadata_and_pixels()
    {
        let src = MemorySource::new();
        let mut img = OrientedImage::zeros(&[3, 4, 5], ScalarKind::Float64).unwrap();
        img.freqdim = Some(1);
        img.phasedim = Some(0);
        img.slicedim = Some(2);
        img.update_slice_timing(0.01, 0, 4, Some(SliceOrder::Seq));
        {
            let mut vm = ViewMut::<f64>::new(img.store_mut()).unwrap();
            for i in 0..60 {
                vm.set(i, i as f64 * 1.5);
            }
        }
        src.write(&img, Path::new("vol.nii")).unwrap();
        let back = src.read(Path::new("vol.nii")).unwrap();

        assert_eq!(back.shape(), img.shape());
        assert_eq!(back.freqdim, Some(1));
        assert_eq!(back.phasedim, Some(0));
        assert_eq!(back.slicedim, Some(2));
        assert_eq!(back.slice_timing(), img.slice_timing());
        let a = View::<f64>::new(img.store()).unwrap();
        let b = View::<f64>::new(back.store()).unwrap();
        for i in 0..60 {
            assert_eq!(a.get(i), b.get(i));
        }
    }

    #[test]
    fn reading_missing_volume_fails_with_path()
    {
        let src = MemorySource::new();
        let err = src.read(Path::new("absent.nii")).unwrap_err();
        assert!(err.to_string().contains("absent.nii"));
    }

    #[test]
    fn reads_are_independent_copies()
    {
        let src = MemorySource::new();
        let img = OrientedImage::zeros(&[4], ScalarKind::Int32).unwrap();
        src.write(&img, Path::new("v")).unwrap();
        let mut a = src.read(Path::new("v")).unwrap();
        {
            let mut vm = ViewMut::<i32>::new(a.store_mut()).unwrap();
            vm.set(0, 42);
        }
        let b = src.read(Path::new("v")).unwrap();
        assert_eq!(View::<i32>::new(b.store()).unwrap().get(0), 0);
    }
}
