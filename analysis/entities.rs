//! Entity dictionaries and the BIDS filename grammar.
//!
//! An entity dictionary is the universal key of the pipeline: it selects
//! input files, names output files, and defines how aggregate outputs
//! inherit metadata from their inputs. Filenames are underscore-separated
//! `key-value` segments followed by a value-less suffix segment and an
//! extension, e.g. `sub-01_task-motor_bold_space-MNI_preproc.nii.gz`.

use std::collections::BTreeMap;
use std::path::Path;

/// Mapping from entity name (`subject`, `session`, `task`, ...) to value.
/// A `BTreeMap` keeps iteration deterministic, which keeps derived paths
/// deterministic.
pub type Entities = BTreeMap<String, String>;

/// Short filename keys and the entity names they expand to.
const ENTITY_KEYS: &[(&str, &str)] = &[
    ("sub", "subject"),
    ("ses", "session"),
    ("task", "task"),
    ("acq", "acquisition"),
    ("run", "run"),
    ("space", "space"),
    ("contrast", "contrast"),
];

/// Extensions the index recognizes. Ordered so that compound extensions
/// are matched before their tails.
const EXTENSIONS: &[&str] = &[".nii.gz", ".nii", ".tsv", ".json"];

/// A filename decomposed into its entity dictionary, suffix ("type"), and
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub entities: Entities,
    pub suffix: String,
    pub extension: String,
}

/// Parses a BIDS-style filename. Returns `None` for files that do not
/// follow the grammar (no known extension, or no trailing suffix segment);
/// such files are simply not indexed.
pub fn parse_filename(name: &str) -> Option<ParsedName> {
    let extension = EXTENSIONS.iter().find(|ext| name.ends_with(*ext))?;
    let stem = &name[..name.len() - extension.len()];

    let mut segments = stem.split('_').collect::<Vec<_>>();
    let suffix = segments.pop()?;
    if suffix.is_empty() || suffix.contains('-') {
        return None;
    }

    let mut entities = Entities::new();
    for segment in segments {
        let Some((key, value)) = segment.split_once('-') else {
            // Value-less mid-name segments ("bold") carry no entity.
            continue;
        };
        if key.is_empty() || value.is_empty() {
            return None;
        }
        let name = ENTITY_KEYS
            .iter()
            .find(|(short, _)| *short == key)
            .map(|(_, long)| (*long).to_string())
            .unwrap_or_else(|| key.to_string());
        entities.insert(name, value.to_string());
    }

    Some(ParsedName {
        entities,
        suffix: suffix.to_string(),
        extension: (*extension).to_string(),
    })
}

/// Parses the entity dictionary of a path, including its suffix under the
/// `type` key. This is the dictionary used when aggregate outputs inherit
/// metadata from their inputs.
pub fn parse_entities(path: &Path) -> Entities {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Entities::new();
    };
    match parse_filename(name) {
        Some(parsed) => {
            let mut entities = parsed.entities;
            entities.insert("type".to_string(), parsed.suffix);
            entities
        }
        None => Entities::new(),
    }
}

/// Keeps only the key-value pairs on which both dictionaries agree.
/// Folded over all inputs of an aggregate, this defines the entity
/// dictionary of the aggregate's output.
pub fn dict_intersection(a: &Entities, b: &Entities) -> Entities {
    a.iter()
        .filter(|(key, value)| b.get(*key) == Some(value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Converts a snake_case identifier to CamelCase for embedding in
/// filenames: `task_gt_rest` becomes `TaskGtRest`. First-level output
/// naming and second-level input lookup must agree on this transform, so
/// both call this one function.
pub fn snake_to_camel(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
