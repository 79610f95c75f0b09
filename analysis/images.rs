//! Volumetric image I/O.
//!
//! Thin wrappers over the `nifti` crate that land data in `ndarray`
//! arrays: 4D series for first-level fitting, 3D volumes for group-level
//! samples and masks, and statistic-map writing. The temporal metadata a
//! first-level unit needs (volume count, repetition time) is read from
//! the series header.

use std::path::{Path, PathBuf};

use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
    #[error("image {path} is {found}-dimensional, expected {expected} dimensions")]
    Dimensionality {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("image {path} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("cannot pool a brain mask from an empty file set")]
    EmptyMaskSet,
}

/// Loads a 4D time series together with its header.
pub fn load_series(path: &Path) -> Result<(Array4<f64>, NiftiHeader), ImageError> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    let data = object.into_volume().into_ndarray::<f64>()?;
    let found = data.ndim();
    let series = data
        .into_dimensionality::<Ix4>()
        .map_err(|_| ImageError::Dimensionality {
            path: path.to_path_buf(),
            expected: 4,
            found,
        })?;
    Ok((series, header))
}

/// Loads a single 3D volume together with its header.
pub fn load_volume(path: &Path) -> Result<(Array3<f64>, NiftiHeader), ImageError> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    let data = object.into_volume().into_ndarray::<f64>()?;
    let found = data.ndim();
    let volume = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| ImageError::Dimensionality {
            path: path.to_path_buf(),
            expected: 3,
            found,
        })?;
    Ok((volume, header))
}

/// Loads a binary brain mask: any voxel above 0.5 is in-mask.
pub fn load_mask(path: &Path) -> Result<Array3<bool>, ImageError> {
    let (volume, _) = load_volume(path)?;
    Ok(volume.mapv(|v| v > 0.5))
}

/// Volume count and repetition time of a 4D series, from its header's
/// fourth dimension.
pub fn series_geometry(path: &Path) -> Result<(usize, f64), ImageError> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    if header.dim[0] < 4 {
        return Err(ImageError::Dimensionality {
            path: path.to_path_buf(),
            expected: 4,
            found: header.dim[0] as usize,
        });
    }
    Ok((header.dim[4] as usize, header.pixdim[4] as f64))
}

/// Pools a brain mask as the voxelwise logical union across all given
/// mask files. 4D masks are collapsed along their time/run axis first.
pub fn union_mask(paths: &[PathBuf]) -> Result<Array3<bool>, ImageError> {
    let mut pooled: Option<Array3<bool>> = None;
    for path in paths {
        let object = ReaderOptions::new().read_file(path)?;
        let data: ArrayD<f64> = object.into_volume().into_ndarray::<f64>()?;
        let volume: Array3<bool> = match data.ndim() {
            3 => data
                .into_dimensionality::<Ix3>()
                .expect("ndim was checked")
                .mapv(|v| v > 0.5),
            4 => data
                .into_dimensionality::<Ix4>()
                .expect("ndim was checked")
                .map_axis(Axis(3), |run| run.iter().any(|&v| v > 0.5)),
            found => {
                return Err(ImageError::Dimensionality {
                    path: path.clone(),
                    expected: 3,
                    found,
                });
            }
        };
        pooled = Some(match pooled {
            None => volume,
            Some(acc) => {
                if acc.shape() != volume.shape() {
                    return Err(ImageError::ShapeMismatch {
                        path: path.clone(),
                        expected: acc.shape().to_vec(),
                        found: volume.shape().to_vec(),
                    });
                }
                let mut merged = acc;
                merged.zip_mut_with(&volume, |a, b| *a = *a || *b);
                merged
            }
        });
    }
    pooled.ok_or(ImageError::EmptyMaskSet)
}

/// Writes a 3D statistic (or mask) volume, optionally carrying spatial
/// metadata over from a reference header.
pub fn write_volume(
    path: &Path,
    data: &Array3<f64>,
    reference: Option<&NiftiHeader>,
) -> Result<(), ImageError> {
    let options = WriterOptions::new(path);
    let options = match reference {
        Some(header) => options.reference_header(header),
        None => options,
    };
    options.write_nifti(data)?;
    Ok(())
}

/// Writes a 4D series with the given repetition time in the header.
pub fn write_series(path: &Path, data: &Array4<f64>, tr: f64) -> Result<(), ImageError> {
    let mut header = NiftiHeader::default();
    header.pixdim = [1.0, 1.0, 1.0, 1.0, tr as f32, 0.0, 0.0, 0.0];
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, Array4};
    use tempfile::tempdir;

    #[test]
    fn series_round_trips_with_its_repetition_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub-01_task-motor_bold_preproc.nii.gz");
        let data = Array4::from_shape_fn((2, 2, 2, 5), |(x, y, z, t)| {
            (x + 2 * y + 4 * z) as f64 + t as f64 / 10.0
        });
        write_series(&path, &data, 2.0).unwrap();

        let (volumes, tr) = series_geometry(&path).unwrap();
        assert_eq!(volumes, 5);
        assert_abs_diff_eq!(tr, 2.0, epsilon = 1e-6);

        let (loaded, _) = load_series(&path).unwrap();
        assert_eq!(loaded.shape(), &[2, 2, 2, 5]);
        assert_abs_diff_eq!(loaded[[1, 1, 1, 4]], data[[1, 1, 1, 4]], epsilon = 1e-6);
    }

    #[test]
    fn union_mask_pools_across_files() {
        let dir = tempdir().unwrap();
        let a_path = dir.path().join("sub-01_task-motor_brainmask.nii.gz");
        let b_path = dir.path().join("sub-02_task-motor_brainmask.nii.gz");

        let mut a = Array3::<f64>::zeros((2, 2, 2));
        a[[0, 0, 0]] = 1.0;
        let mut b = Array3::<f64>::zeros((2, 2, 2));
        b[[1, 1, 1]] = 1.0;
        write_volume(&a_path, &a, None).unwrap();
        write_volume(&b_path, &b, None).unwrap();

        let pooled = union_mask(&[a_path, b_path]).unwrap();
        assert!(pooled[[0, 0, 0]]);
        assert!(pooled[[1, 1, 1]]);
        assert!(!pooled[[0, 1, 0]]);
    }

    #[test]
    fn empty_mask_set_is_an_error() {
        assert!(matches!(union_mask(&[]), Err(ImageError::EmptyMaskSet)));
    }
}
