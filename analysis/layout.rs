//! The entity-keyed file index.
//!
//! A `FileIndex` is built by walking a dataset root and parsing every
//! conforming filename into its entity dictionary. Lookups are pure
//! filters over the parsed dictionaries; the index never touches file
//! contents. Two indices (raw and preprocessed roots) are merged so that
//! entity lookups transparently span both trees.

use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::entities::{self, Entities};

/// The fixed path template for group-level outputs. Bracketed segments are
/// omitted when the corresponding entity is absent.
pub const DERIVATIVES_PATTERN: &str = "[sub-{subject}/][ses-{session}/][sub-{subject}]\
[_ses-{session}]_task-{task}_bold[_space-{space}][_contrast-{contrast}]_{type}.nii.gz";

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("IO error while indexing: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to walk dataset tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(
        "cannot build output path: template field '{field}' is not present in the entity \
         dictionary {entities:?}"
    )]
    PathBuild { field: String, entities: Entities },
    #[error("malformed path template near '{0}'")]
    MalformedTemplate(String),
}

/// An entity-tagged file discovered by the index. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub path: PathBuf,
    pub entities: Entities,
    pub suffix: String,
    pub extension: String,
}

impl FileRef {
    /// The file's entity dictionary including its suffix under `type`,
    /// as inherited by derived outputs.
    pub fn full_entities(&self) -> Entities {
        let mut ents = self.entities.clone();
        ents.insert("type".to_string(), self.suffix.clone());
        ents
    }
}

/// An index over one or more dataset roots.
#[derive(Debug, Default)]
pub struct FileIndex {
    files: Vec<FileRef>,
}

impl FileIndex {
    /// Walks `root` and indexes every file whose name follows the entity
    /// grammar. Files with unrecognized names are skipped, not errors.
    pub fn index(root: &Path) -> Result<Self, LayoutError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some(parsed) = entities::parse_filename(name) {
                files.push(FileRef {
                    path: entry.into_path(),
                    entities: parsed.entities,
                    suffix: parsed.suffix,
                    extension: parsed.extension,
                });
            }
        }
        log::debug!("indexed {} files under {}", files.len(), root.display());
        Ok(FileIndex { files })
    }

    /// Merges another index into this one; lookups then span both roots.
    pub fn merge(mut self, other: FileIndex) -> FileIndex {
        self.files.extend(other.files);
        self
    }

    /// All files with the given suffix whose entity dictionaries contain
    /// every key-value pair of `filter`.
    pub fn query(&self, suffix: &str, filter: &Entities) -> Vec<&FileRef> {
        self.files
            .iter()
            .filter(|f| f.suffix == suffix)
            .filter(|f| {
                filter
                    .iter()
                    .all(|(key, value)| f.entities.get(key) == Some(value))
            })
            .collect()
    }

    /// Distinct values of one entity across the index, sorted.
    pub fn values(&self, entity: &str) -> Vec<String> {
        use itertools::Itertools;
        self.files
            .iter()
            .filter_map(|f| f.entities.get(entity).cloned())
            .sorted()
            .dedup()
            .collect()
    }

    /// Renders the derivatives path template against an entity dictionary.
    /// In strict mode every field referenced outside an optional bracket
    /// must resolve; optional segments are dropped when any of their
    /// fields is absent.
    pub fn build_path(&self, ents: &Entities, strict: bool) -> Result<PathBuf, LayoutError> {
        render_pattern(DERIVATIVES_PATTERN, ents, strict).map(PathBuf::from)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Renders a path pattern of literal text, `{field}` substitutions, and
/// `[optional]` groups (no nesting).
fn render_pattern(pattern: &str, ents: &Entities, strict: bool) -> Result<String, LayoutError> {
    let mut out = String::new();
    let mut rest = pattern;

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('[') {
            let Some(end) = tail.find(']') else {
                return Err(LayoutError::MalformedTemplate(rest.to_string()));
            };
            if let Some(segment) = render_segment(&tail[..end], ents)? {
                out.push_str(&segment);
            }
            rest = &tail[end + 1..];
        } else {
            let next = rest.find('[').unwrap_or(rest.len());
            let (mandatory, remainder) = rest.split_at(next);
            out.push_str(&render_mandatory(mandatory, ents, strict)?);
            rest = remainder;
        }
    }
    Ok(out)
}

/// Renders an optional segment, or `None` when a referenced field is
/// absent from the dictionary.
fn render_segment(segment: &str, ents: &Entities) -> Result<Option<String>, LayoutError> {
    let mut out = String::new();
    let mut rest = segment;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            return Err(LayoutError::MalformedTemplate(rest.to_string()));
        };
        out.push_str(&rest[..start]);
        let field = &rest[start + 1..start + end];
        match ents.get(field) {
            Some(value) => out.push_str(value),
            None => return Ok(None),
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(Some(out))
}

/// Renders unbracketed template text; in strict mode a missing field is a
/// `PathBuild` error, otherwise the field renders as nothing.
fn render_mandatory(text: &str, ents: &Entities, strict: bool) -> Result<String, LayoutError> {
    let mut out = String::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            return Err(LayoutError::MalformedTemplate(rest.to_string()));
        };
        out.push_str(&rest[..start]);
        let field = &rest[start + 1..start + end];
        match ents.get(field) {
            Some(value) => out.push_str(value),
            None if strict => {
                return Err(LayoutError::PathBuild {
                    field: field.to_string(),
                    entities: ents.clone(),
                });
            }
            None => {}
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entities(pairs: &[(&str, &str)]) -> Entities {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn index_parses_and_filters_by_entities() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("sub-01/func/sub-01_task-motor_bold_space-MNI_preproc.nii.gz"));
        touch(&root.join("sub-02/func/sub-02_task-motor_bold_space-MNI_preproc.nii.gz"));
        touch(&root.join("sub-01/func/sub-01_task-motor_events.tsv"));
        touch(&root.join("dataset_description.json"));

        let index = FileIndex::index(root).unwrap();
        let hits = index.query("preproc", &entities(&[("subject", "01")]));
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].entities.get("space").map(String::as_str),
            Some("MNI")
        );

        assert_eq!(index.values("subject"), vec!["01", "02"]);
        // `dataset_description.json` has no entity segments but does have a
        // suffix segment, so it indexes under its own suffix.
        assert!(index.query("description", &Entities::new()).len() <= 1);
    }

    #[test]
    fn merged_indices_span_both_roots() {
        let raw = tempdir().unwrap();
        let prep = tempdir().unwrap();
        touch(&raw.path().join("sub-01_task-motor_events.tsv"));
        touch(&prep.path().join("sub-01_task-motor_bold_space-MNI_preproc.nii.gz"));

        let merged = FileIndex::index(raw.path())
            .unwrap()
            .merge(FileIndex::index(prep.path()).unwrap());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.query("events", &Entities::new()).len(), 1);
        assert_eq!(merged.query("preproc", &Entities::new()).len(), 1);
    }

    #[test]
    fn build_path_renders_optional_segments() {
        let index = FileIndex::default();
        let full = entities(&[
            ("subject", "01"),
            ("session", "02"),
            ("task", "motor"),
            ("space", "MNI"),
            ("contrast", "TaskGtRest"),
            ("type", "stat"),
        ]);
        assert_eq!(
            index.build_path(&full, true).unwrap(),
            PathBuf::from(
                "sub-01/ses-02/sub-01_ses-02_task-motor_bold_space-MNI_contrast-TaskGtRest_stat.nii.gz"
            )
        );

        let minimal = entities(&[("task", "motor"), ("type", "stat")]);
        assert_eq!(
            index.build_path(&minimal, true).unwrap(),
            PathBuf::from("task-motor_bold_stat.nii.gz")
        );
    }

    #[test]
    fn build_path_strict_requires_mandatory_fields() {
        let index = FileIndex::default();
        let missing_task = entities(&[("subject", "01"), ("type", "stat")]);
        match index.build_path(&missing_task, true) {
            Err(LayoutError::PathBuild { field, .. }) => assert_eq!(field, "task"),
            other => panic!("expected PathBuild error, got {other:?}"),
        }
        // Non-strict rendering drops the unresolved field instead.
        assert!(index.build_path(&missing_task, false).is_ok());
    }
}
