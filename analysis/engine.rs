//! The model-fitting seam and the built-in least-squares engine.
//!
//! The pipeline stages never compute statistics themselves; they talk to
//! a `FittingEngine`, get back a `FittedModel`, and ask it for contrast
//! `StatImage`s. `OlsEngine` is the in-crate implementation: per-voxel
//! ordinary least squares with T and F contrast maps. Tests substitute
//! counting or stub engines through the same seam.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3, ArrayView1};
use nifti::NiftiHeader;
use thiserror::Error;

use crate::design::DesignMatrix;
use crate::images::{self, ImageError};
use crate::model::StatType;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("cannot fit a group model over an empty sample set")]
    EmptySamples,
    #[error("design has {rows} rows but the data provides {samples} samples")]
    DesignRowMismatch { rows: usize, samples: usize },
    #[error("design matrix is singular; regressors are linearly dependent")]
    SingularDesign,
    #[error(
        "not enough samples for the design: {samples} samples, {regressors} regressors \
         leave no residual degrees of freedom"
    )]
    InsufficientDegreesOfFreedom { samples: usize, regressors: usize },
    #[error("contrast weight vector has {found} entries, design has {expected} columns")]
    WeightLength { expected: usize, found: usize },
    #[error("mask shape {mask:?} does not match data shape {data:?}")]
    MaskShapeMismatch { mask: Vec<usize>, data: Vec<usize> },
}

/// What the engine fits: one 4D time series (first level) or a stack of
/// 3D sample images (group level).
#[derive(Debug, Clone, Copy)]
pub enum FitData<'a> {
    Series(&'a Path),
    Samples(&'a [PathBuf]),
}

/// Where the brain mask comes from, when one applies.
#[derive(Debug, Clone, Copy)]
pub enum MaskSource<'a> {
    File(&'a Path),
    Volume(&'a Array3<bool>),
}

/// A computed statistic map that can be persisted.
pub trait StatImage {
    fn save(&self, path: &Path) -> Result<(), EngineError>;
}

/// A fitted model, ready to compute contrasts.
pub trait FittedModel {
    type Stat: StatImage;

    /// Computes a contrast statistic image from a design-width weight
    /// vector.
    fn compute_contrast(
        &self,
        weights: ArrayView1<'_, f64>,
        stat_type: StatType,
    ) -> Result<Self::Stat, EngineError>;
}

/// The opaque numerical engine contract: `fit(data, mask, design)`.
pub trait FittingEngine {
    type Fitted: FittedModel;

    fn fit(
        &self,
        data: FitData<'_>,
        mask: Option<MaskSource<'_>>,
        design: &DesignMatrix,
    ) -> Result<Self::Fitted, EngineError>;
}

/// Per-voxel ordinary least squares.
#[derive(Debug, Default, Clone, Copy)]
pub struct OlsEngine;

/// The state of a completed OLS fit over all in-mask voxels.
#[derive(Debug)]
pub struct OlsFit {
    betas: Array2<f64>,
    sigma2: Array1<f64>,
    xtx_inv: Array2<f64>,
    voxels: Vec<[usize; 3]>,
    shape: [usize; 3],
    header: NiftiHeader,
}

/// A statistic map computed from an `OlsFit`.
pub struct OlsStatImage {
    pub data: Array3<f64>,
    header: NiftiHeader,
}

impl FittingEngine for OlsEngine {
    type Fitted = OlsFit;

    fn fit(
        &self,
        data: FitData<'_>,
        mask: Option<MaskSource<'_>>,
        design: &DesignMatrix,
    ) -> Result<OlsFit, EngineError> {
        let (observations, shape, header) = load_observations(data)?;
        let n = observations.nrows();
        let k = design.n_columns();
        if n != design.n_rows() {
            return Err(EngineError::DesignRowMismatch {
                rows: design.n_rows(),
                samples: n,
            });
        }
        if n <= k {
            return Err(EngineError::InsufficientDegreesOfFreedom {
                samples: n,
                regressors: k,
            });
        }

        let mask = resolve_mask(mask, shape)?;
        let voxels = in_mask_voxels(shape, mask.as_ref());

        // Gather the in-mask observation matrix: one column per voxel.
        let mut y = Array2::<f64>::zeros((n, voxels.len()));
        for (column, &[x_i, y_i, z_i]) in voxels.iter().enumerate() {
            let flat = flatten(shape, x_i, y_i, z_i);
            for row in 0..n {
                y[[row, column]] = observations[[row, flat]];
            }
        }

        let x = &design.values;
        let xtx = x.t().dot(x);
        let xtx_inv = invert(&xtx).ok_or(EngineError::SingularDesign)?;
        let betas = xtx_inv.dot(&x.t().dot(&y));

        let residuals = &y - &x.dot(&betas);
        let dof = (n - k) as f64;
        let sigma2 = residuals
            .columns()
            .into_iter()
            .map(|column| column.iter().map(|r| r * r).sum::<f64>() / dof)
            .collect::<Array1<f64>>();

        Ok(OlsFit {
            betas,
            sigma2,
            xtx_inv,
            voxels,
            shape,
            header,
        })
    }
}

impl FittedModel for OlsFit {
    type Stat = OlsStatImage;

    fn compute_contrast(
        &self,
        weights: ArrayView1<'_, f64>,
        stat_type: StatType,
    ) -> Result<OlsStatImage, EngineError> {
        let k = self.betas.nrows();
        if weights.len() != k {
            return Err(EngineError::WeightLength {
                expected: k,
                found: weights.len(),
            });
        }

        let variance_scale = weights.dot(&self.xtx_inv.dot(&weights));
        let mut data = Array3::<f64>::zeros(self.shape);
        for (column, &[x_i, y_i, z_i]) in self.voxels.iter().enumerate() {
            let effect = weights.dot(&self.betas.column(column));
            let variance = self.sigma2[column] * variance_scale;
            let t = if variance > 0.0 {
                effect / variance.sqrt()
            } else {
                0.0
            };
            data[[x_i, y_i, z_i]] = match stat_type {
                StatType::T => t,
                // Every contrast in this pipeline is a single row, so the
                // F statistic reduces to t squared.
                StatType::F => t * t,
            };
        }

        Ok(OlsStatImage {
            data,
            header: self.header.clone(),
        })
    }
}

impl StatImage for OlsStatImage {
    fn save(&self, path: &Path) -> Result<(), EngineError> {
        images::write_volume(path, &self.data, Some(&self.header))?;
        Ok(())
    }
}

/// Loads the fit input as a row-per-observation matrix over flattened
/// voxels, plus the spatial shape and a header to write outputs with.
fn load_observations(
    data: FitData<'_>,
) -> Result<(Array2<f64>, [usize; 3], NiftiHeader), EngineError> {
    match data {
        FitData::Series(path) => {
            let (series, header) = images::load_series(path)?;
            let (nx, ny, nz, nt) = series.dim();
            let shape = [nx, ny, nz];
            let mut observations = Array2::<f64>::zeros((nt, nx * ny * nz));
            for ((x, y, z, t), value) in series.indexed_iter() {
                observations[[t, flatten(shape, x, y, z)]] = *value;
            }
            Ok((observations, shape, header))
        }
        FitData::Samples(paths) => {
            if paths.is_empty() {
                return Err(EngineError::EmptySamples);
            }
            let (first, header) = images::load_volume(&paths[0])?;
            let (nx, ny, nz) = first.dim();
            let shape = [nx, ny, nz];
            let mut observations = Array2::<f64>::zeros((paths.len(), nx * ny * nz));
            fill_observation_row(&mut observations, 0, &first, shape);
            for (row, path) in paths.iter().enumerate().skip(1) {
                let (volume, _) = images::load_volume(path)?;
                if volume.dim() != first.dim() {
                    return Err(EngineError::Image(ImageError::ShapeMismatch {
                        path: path.clone(),
                        expected: first.shape().to_vec(),
                        found: volume.shape().to_vec(),
                    }));
                }
                fill_observation_row(&mut observations, row, &volume, shape);
            }
            Ok((observations, shape, header))
        }
    }
}

fn fill_observation_row(
    observations: &mut Array2<f64>,
    row: usize,
    volume: &Array3<f64>,
    shape: [usize; 3],
) {
    for ((x, y, z), value) in volume.indexed_iter() {
        observations[[row, flatten(shape, x, y, z)]] = *value;
    }
}

fn resolve_mask(
    mask: Option<MaskSource<'_>>,
    shape: [usize; 3],
) -> Result<Option<Array3<bool>>, EngineError> {
    let resolved = match mask {
        None => None,
        Some(MaskSource::File(path)) => Some(images::load_mask(path)?),
        Some(MaskSource::Volume(volume)) => Some(volume.clone()),
    };
    if let Some(volume) = &resolved {
        if volume.shape() != shape {
            return Err(EngineError::MaskShapeMismatch {
                mask: volume.shape().to_vec(),
                data: shape.to_vec(),
            });
        }
    }
    Ok(resolved)
}

fn in_mask_voxels(shape: [usize; 3], mask: Option<&Array3<bool>>) -> Vec<[usize; 3]> {
    let mut voxels = Vec::new();
    for x in 0..shape[0] {
        for y in 0..shape[1] {
            for z in 0..shape[2] {
                if mask.map_or(true, |m| m[[x, y, z]]) {
                    voxels.push([x, y, z]);
                }
            }
        }
    }
    voxels
}

fn flatten(shape: [usize; 3], x: usize, y: usize, z: usize) -> usize {
    (x * shape[1] + y) * shape[2] + z
}

/// Inverts a small dense symmetric matrix by Gauss-Jordan elimination
/// with partial pivoting. Returns `None` when the matrix is singular.
fn invert(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let k = matrix.nrows();
    let mut work = matrix.clone();
    let mut inverse = Array2::<f64>::eye(k);

    for pivot in 0..k {
        let mut best = pivot;
        for row in pivot + 1..k {
            if work[[row, pivot]].abs() > work[[best, pivot]].abs() {
                best = row;
            }
        }
        if work[[best, pivot]].abs() < 1e-12 {
            return None;
        }
        if best != pivot {
            for col in 0..k {
                work.swap([pivot, col], [best, col]);
                inverse.swap([pivot, col], [best, col]);
            }
        }
        let scale = work[[pivot, pivot]];
        for col in 0..k {
            work[[pivot, col]] /= scale;
            inverse[[pivot, col]] /= scale;
        }
        for row in 0..k {
            if row == pivot {
                continue;
            }
            let factor = work[[row, pivot]];
            if factor == 0.0 {
                continue;
            }
            for col in 0..k {
                let w = work[[pivot, col]];
                let i = inverse[[pivot, col]];
                work[[row, col]] -= factor * w;
                inverse[[row, col]] -= factor * i;
            }
        }
    }
    Some(inverse)
}
