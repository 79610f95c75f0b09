//! Simplified single-pass group t-test.
//!
//! A looser sibling of the second-level stage: it restricts the analysis
//! to the model's first block, pools one brain mask across all matching
//! preprocessed runs, and selects first-level statistic images by literal
//! substring match on the contrast tag rather than by entity lookup. The
//! two matching strategies are deliberately distinct and both preserved.

use std::path::Path;

use ndarray::array;

use crate::analysis::{Analysis, RunError};
use crate::design::DesignMatrix;
use crate::engine::{FitData, FittedModel, FittingEngine, MaskSource, StatImage};
use crate::entities::{snake_to_camel, Entities};
use crate::layout::FileIndex;
use crate::model::StatType;

/// Runs a one-sample T test per contrast of the first block, over every
/// first-level statistic image matching the selector set.
pub fn ttest<E: FittingEngine>(
    model_path: &Path,
    raw_root: &Path,
    preproc_root: &Path,
    derivatives_root: &Path,
    engine: &E,
    session: Option<&str>,
    task: Option<&str>,
    space: Option<&str>,
) -> Result<(), RunError> {
    let mut selectors = Entities::new();
    if let Some(session) = session {
        selectors.insert("session".to_string(), session.to_string());
    }
    if let Some(task) = task {
        selectors.insert("task".to_string(), task.to_string());
    }

    let analysis = Analysis::init(model_path, raw_root, preproc_root, selectors)?;
    let block = analysis.model.blocks.first().expect("validated non-empty");

    let mut image_selectors = analysis.selectors.clone();
    if let Some(space) = space {
        image_selectors
            .entry("space".to_string())
            .or_insert_with(|| space.to_string());
    }

    let prep_index = FileIndex::index(preproc_root)?;
    let mask_paths: Vec<_> = prep_index
        .query("brainmask", &image_selectors)
        .into_iter()
        .map(|f| f.path.clone())
        .collect();
    if mask_paths.is_empty() {
        return Err(RunError::MissingResource {
            kind: "brainmask".to_string(),
            query: image_selectors,
        });
    }
    let pooled_mask = crate::images::union_mask(&mask_paths)?;
    log::info!("pooled brain mask from {} runs", mask_paths.len());

    let fl_index = FileIndex::index(derivatives_root)?;
    for contrast in &block.contrasts {
        let tag = format!("contrast-{}", snake_to_camel(&contrast.name));
        let stat_files: Vec<_> = fl_index
            .query("stat", &image_selectors)
            .into_iter()
            .filter(|f| {
                f.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&tag))
            })
            .map(|f| f.path.clone())
            .collect();
        if stat_files.is_empty() {
            return Err(RunError::MissingResource {
                kind: format!("stat ({tag})"),
                query: image_selectors.clone(),
            });
        }

        // Output name: the first input's basename, stripped of its leading
        // entity segment.
        let first_name = stat_files[0]
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RunError::MalformedInputName(stat_files[0].clone()))?;
        let basename = first_name
            .split_once('_')
            .map(|(_, rest)| rest)
            .ok_or_else(|| RunError::MalformedInputName(stat_files[0].clone()))?;
        let out_path = derivatives_root.join(basename);

        if out_path.exists() {
            log::debug!("skipping existing output {}", out_path.display());
            continue;
        }

        log::info!(
            "group t-test for '{}' over {} images",
            contrast.name,
            stat_files.len()
        );
        let design = DesignMatrix::intercept_only(stat_files.len());
        let fitted = engine.fit(
            FitData::Samples(&stat_files),
            Some(MaskSource::Volume(&pooled_mask)),
            &design,
        )?;
        let stat = fitted.compute_contrast(array![1.0].view(), StatType::T)?;
        stat.save(&out_path)?;
        log::info!("wrote {}", out_path.display());
    }

    Ok(())
}
