//! The group-level stage: aggregation of first-level contrast maps.
//!
//! A second-level block groups first-level statistic images across
//! subjects/sessions, names its outputs by entity intersection, and fits
//! a minimal intercept (or weighted) design per group unit. The `split`
//! transformation fans a condition out across the values of a grouping
//! entity; its mapping table is an explicit input and output of this
//! stage so repeated calls over several blocks accumulate visibly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::Array1;

use crate::analysis::{Analysis, RunError};
use crate::design::DesignMatrix;
use crate::engine::{FitData, FittedModel, FittingEngine, StatImage};
use crate::entities::{dict_intersection, snake_to_camel, Entities};
use crate::layout::{FileIndex, FileRef};
use crate::model::Block;

/// Synthetic condition name -> (source column, extra entity constraint).
/// `split` inserts one entry per distinct value of its grouping entity:
/// `"01.baseline" -> ("baseline", {subject: "01"})`.
pub type SplitMapping = BTreeMap<String, (String, Entities)>;

/// Runs the group-level stage for one block, returning the updated
/// transformation mapping for use by later blocks.
pub fn second_level<E: FittingEngine>(
    analysis: &Analysis,
    block: &Block,
    engine: &E,
    derivatives_root: &Path,
    mapping: SplitMapping,
) -> Result<SplitMapping, RunError> {
    let fl_index = FileIndex::index(derivatives_root)?;
    let mapping = apply_transformations(analysis, block, mapping)?;

    for unit_ents in analysis.group_units(block) {
        for contrast in &block.contrasts {
            let mut samples: Vec<FileRef> = Vec::new();
            for condition in &contrast.condition_list {
                let default = (condition.clone(), Entities::new());
                let (real_condition, mapped_ents) = mapping.get(condition).unwrap_or(&default);

                let mut query = unit_ents.clone();
                query.extend(analysis.selectors.clone());
                query.extend(mapped_ents.clone());
                query.insert(
                    "contrast".to_string(),
                    snake_to_camel(real_condition),
                );

                samples.extend(fl_index.query("stat", &query).into_iter().cloned());
            }
            let data: Vec<PathBuf> = samples.iter().map(|f| f.path.clone()).collect();

            if data.is_empty() {
                let mut query = unit_ents.clone();
                query.insert(
                    "contrast".to_string(),
                    snake_to_camel(&contrast.name),
                );
                return Err(RunError::MissingResource {
                    kind: "stat".to_string(),
                    query,
                });
            }

            let stat_path = derivatives_root.join(output_path(&fl_index, &samples, contrast)?);
            if stat_path.exists() {
                log::debug!("skipping existing output {}", stat_path.display());
                continue;
            }

            // Intercept-only design, plus a literal weight column when the
            // contrast weights are not uniformly one.
            let uniform = contrast.weights.iter().all(|w| (w - 1.0).abs() < 1e-12);
            let (design, tested_column) = if uniform {
                (DesignMatrix::intercept_only(data.len()), "intercept")
            } else {
                (
                    DesignMatrix::intercept_only(data.len())
                        .with_column(&contrast.name, &contrast.weights)?,
                    contrast.name.as_str(),
                )
            };

            log::info!(
                "group unit {:?}, contrast '{}': fitting {} samples",
                unit_ents,
                contrast.name,
                data.len()
            );
            let fitted = engine.fit(FitData::Samples(&data), None, &design)?;

            let mut weights = Array1::<f64>::zeros(design.n_columns());
            let column = design
                .column_index(tested_column)
                .expect("tested column was just added to the design");
            weights[column] = 1.0;

            let stat = fitted.compute_contrast(weights.view(), contrast.stat_type)?;
            if let Some(parent) = stat_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            stat.save(&stat_path)?;
            log::info!("wrote {}", stat_path.display());
        }
    }

    Ok(mapping)
}

/// Applies the block's transformations to the mapping table. Only the
/// `split` operator is recognized.
fn apply_transformations(
    analysis: &Analysis,
    block: &Block,
    mut mapping: SplitMapping,
) -> Result<SplitMapping, RunError> {
    for xform in &block.transformations {
        if xform.name != "split" {
            return Err(RunError::UnsupportedTransform(xform.name.clone()));
        }
        let by = xform.by.as_deref().unwrap_or_default();
        if by != "subject" && by != "session" {
            return Err(RunError::UnsupportedTransform(format!(
                "split by '{by}' (expected 'subject' or 'session')"
            )));
        }
        for input_column in &xform.input {
            for value in analysis.index.values(by) {
                let mut ents = Entities::new();
                ents.insert(by.to_string(), value.clone());
                mapping.insert(
                    format!("{value}.{input_column}"),
                    (input_column.clone(), ents),
                );
            }
        }
    }
    Ok(mapping)
}

/// Derives the output path for a contrast: the pairwise entity
/// intersection of every input file, with `contrast` forced to the
/// contrast's CamelCase name, rendered through the strict path template.
fn output_path(
    fl_index: &FileIndex,
    samples: &[FileRef],
    contrast: &crate::model::Contrast,
) -> Result<PathBuf, RunError> {
    let mut parsed = samples.iter().map(FileRef::full_entities);
    let first = parsed.next().expect("sample set is checked non-empty");
    let mut out_ents = parsed.fold(first, |acc, ents| dict_intersection(&acc, &ents));
    out_ents.insert("contrast".to_string(), snake_to_camel(&contrast.name));
    Ok(fl_index.build_path(&out_ents, true)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, Level, Transformation};
    use std::fs;
    use tempfile::tempdir;

    fn split_block(input: &str, by: &str) -> Block {
        Block {
            level: Level::Dataset,
            conditions: vec![],
            contrasts: vec![],
            transformations: vec![Transformation {
                name: "split".to_string(),
                input: vec![input.to_string()],
                by: Some(by.to_string()),
            }],
        }
    }

    fn analysis_with_subjects(subjects: &[&str]) -> (Analysis, tempfile::TempDir) {
        let raw = tempdir().unwrap();
        for subject in subjects {
            let path = raw
                .path()
                .join(format!("sub-{subject}/sub-{subject}_task-motor_events.tsv"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "onset\tduration\ttrial_type\n0.0\t1.0\ttask\n").unwrap();
        }
        let model_path = raw.path().join("model.json");
        fs::write(
            &model_path,
            r#"{"blocks": [{"level": "dataset", "contrasts": []}]}"#,
        )
        .unwrap();
        let prep = raw.path().join("derivatives");
        fs::create_dir_all(&prep).unwrap();
        let analysis = Analysis::init(
            &model_path,
            raw.path(),
            &prep,
            Entities::new(),
        )
        .unwrap();
        (analysis, raw)
    }

    #[test]
    fn split_fans_a_condition_out_per_subject() {
        let (analysis, _raw) = analysis_with_subjects(&["01", "02"]);
        let block = split_block("baseline", "subject");

        let mapping =
            apply_transformations(&analysis, &block, SplitMapping::new()).unwrap();

        assert_eq!(mapping.len(), 2);
        let (condition, ents) = &mapping["01.baseline"];
        assert_eq!(condition, "baseline");
        assert_eq!(ents.get("subject").map(String::as_str), Some("01"));
        let (condition, ents) = &mapping["02.baseline"];
        assert_eq!(condition, "baseline");
        assert_eq!(ents.get("subject").map(String::as_str), Some("02"));
    }

    #[test]
    fn mappings_accumulate_across_blocks() {
        let (analysis, _raw) = analysis_with_subjects(&["01"]);

        let mapping = apply_transformations(
            &analysis,
            &split_block("baseline", "subject"),
            SplitMapping::new(),
        )
        .unwrap();
        let mapping =
            apply_transformations(&analysis, &split_block("response", "subject"), mapping)
                .unwrap();

        assert_eq!(mapping.len(), 2);
        assert!(mapping.contains_key("01.baseline"));
        assert!(mapping.contains_key("01.response"));
    }

    #[test]
    fn unknown_transformations_are_fatal() {
        let (analysis, _raw) = analysis_with_subjects(&["01"]);
        let mut block = split_block("baseline", "subject");
        block.transformations[0].name = "orthogonalize".to_string();

        match apply_transformations(&analysis, &block, SplitMapping::new()) {
            Err(RunError::UnsupportedTransform(name)) => assert_eq!(name, "orthogonalize"),
            other => panic!("expected UnsupportedTransform, got {other:?}"),
        }
    }

    #[test]
    fn split_by_an_unknown_entity_is_fatal() {
        let (analysis, _raw) = analysis_with_subjects(&["01"]);
        let block = split_block("baseline", "acquisition");
        assert!(matches!(
            apply_transformations(&analysis, &block, SplitMapping::new()),
            Err(RunError::UnsupportedTransform(_))
        ));
    }
}
