//! The first-level stage: per-run GLM fits and contrast maps.
//!
//! For every fittable unit of a run-level block this stage locates the
//! unique preprocessed image, builds and persists the unit's design
//! matrix, and computes one statistic image per contrast. Outputs that
//! already exist are recorded and skipped, so re-running after a partial
//! failure resumes from the first missing output.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array1;

use crate::analysis::{Analysis, RunError};
use crate::design::DesignMatrix;
use crate::engine::{FitData, FittedModel, FittingEngine, MaskSource, StatImage};
use crate::entities::{snake_to_camel, Entities};
use crate::images;
use crate::model::Block;

/// The normalized space first-level inputs are resolved in.
pub const NORMALIZED_SPACE: &str = "MNI152NLin2009cAsym";

const PREPROC_SUFFIX: &str = "_preproc.nii.gz";

/// Runs the first-level stage for one block. Returns, per contrast name,
/// the ordered list of statistic image paths (pre-existing or computed).
pub fn first_level<E: FittingEngine>(
    analysis: &Analysis,
    block: &Block,
    engine: &E,
    output_root: &Path,
) -> Result<BTreeMap<String, Vec<PathBuf>>, RunError> {
    let mut outputs: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for (events, ents) in analysis.first_level_units(block)? {
        let preproc = resolve_unique(analysis, "preproc", &ents)?;
        let base = preproc
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(PREPROC_SUFFIX))
            .ok_or_else(|| RunError::MalformedInputName(preproc.clone()))?
            .to_string();

        let out_dir = unit_output_dir(output_root, &ents);
        fs::create_dir_all(&out_dir)?;

        let (n_volumes, tr) = images::series_geometry(&preproc)?;
        let design = DesignMatrix::from_events(&events, n_volumes, tr)?;
        design.write_tsv(&out_dir.join(format!("{base}_design.tsv")))?;
        log::info!(
            "first-level unit {:?}: {} volumes at TR {:.3}s, {} regressors",
            ents,
            n_volumes,
            tr,
            design.n_columns()
        );

        let brainmask = resolve_mask_path(analysis, &ents)?;

        // The model is fitted lazily, at most once per unit, on the first
        // contrast whose output does not already exist.
        let mut fitted: Option<E::Fitted> = None;
        for contrast in &block.contrasts {
            let stat_name = format!(
                "{base}_contrast-{}_stat.nii.gz",
                snake_to_camel(&contrast.name)
            );
            let stat_path = out_dir.join(stat_name);
            outputs
                .entry(contrast.name.clone())
                .or_default()
                .push(stat_path.clone());

            if stat_path.exists() {
                log::debug!("skipping existing output {}", stat_path.display());
                continue;
            }

            if fitted.is_none() {
                fitted = Some(engine.fit(
                    FitData::Series(&preproc),
                    Some(MaskSource::File(&brainmask)),
                    &design,
                )?);
            }
            let model = fitted.as_ref().expect("fitted on the line above");

            let mut weights = Array1::<f64>::zeros(design.n_columns());
            for (condition, weight) in contrast.condition_list.iter().zip(&contrast.weights) {
                let column = design.column_index(condition).ok_or_else(|| {
                    RunError::UnknownCondition {
                        contrast: contrast.name.clone(),
                        condition: condition.clone(),
                        available: design.columns.clone(),
                    }
                })?;
                weights[column] = *weight;
            }

            let stat = model.compute_contrast(weights.view(), contrast.stat_type)?;
            stat.save(&stat_path)?;
            log::info!("wrote {}", stat_path.display());
        }
    }

    Ok(outputs)
}

/// Resolves the single preprocessed image for a unit. Zero or multiple
/// matches abort the run before any engine call, with the candidate list
/// in the error.
fn resolve_unique(
    analysis: &Analysis,
    kind: &str,
    ents: &Entities,
) -> Result<PathBuf, RunError> {
    let mut query = ents.clone();
    query.insert("space".to_string(), NORMALIZED_SPACE.to_string());
    let matches = analysis.index.query(kind, &query);
    if matches.len() != 1 {
        return Err(RunError::AmbiguousInput {
            kind: kind.to_string(),
            query,
            candidates: matches.into_iter().map(|f| f.path.clone()).collect(),
        });
    }
    Ok(matches[0].path.clone())
}

/// Resolves the unit's brain mask: exactly one match is required, with no
/// fallback.
fn resolve_mask_path(analysis: &Analysis, ents: &Entities) -> Result<PathBuf, RunError> {
    let matches = analysis.index.query("brainmask", ents);
    match matches.len() {
        0 => Err(RunError::MissingResource {
            kind: "brainmask".to_string(),
            query: ents.clone(),
        }),
        1 => Ok(matches[0].path.clone()),
        _ => Err(RunError::AmbiguousInput {
            kind: "brainmask".to_string(),
            query: ents.clone(),
            candidates: matches.into_iter().map(|f| f.path.clone()).collect(),
        }),
    }
}

/// Output directory for a unit: nested under `sub-<subject>/` and
/// `ses-<session>/` when those entities are present.
fn unit_output_dir(output_root: &Path, ents: &Entities) -> PathBuf {
    let mut dir = output_root.to_path_buf();
    if let Some(subject) = ents.get("subject") {
        dir.push(format!("sub-{subject}"));
    }
    if let Some(session) = ents.get("session") {
        dir.push(format!("ses-{session}"));
    }
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_nests_by_subject_and_session() {
        let mut ents = Entities::new();
        assert_eq!(
            unit_output_dir(Path::new("/out"), &ents),
            PathBuf::from("/out")
        );
        ents.insert("subject".to_string(), "01".to_string());
        assert_eq!(
            unit_output_dir(Path::new("/out"), &ents),
            PathBuf::from("/out/sub-01")
        );
        ents.insert("session".to_string(), "02".to_string());
        assert_eq!(
            unit_output_dir(Path::new("/out"), &ents),
            PathBuf::from("/out/sub-01/ses-02")
        );
    }
}
