//! Analysis setup and fittable-unit iteration.
//!
//! An `Analysis` binds a parsed model to a merged file index (raw root
//! plus preprocessed root) and to the dataset-wide selector entities.
//! It is constructed once per invocation and read-only afterwards; every
//! stage receives it by reference, never through process-wide state.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use thiserror::Error;

use crate::design::{DesignError, EventsTable};
use crate::engine::EngineError;
use crate::entities::Entities;
use crate::images::ImageError;
use crate::layout::{FileIndex, LayoutError};
use crate::model::{Block, Level, Model, ModelError};

/// Fatal errors raised while running the pipeline stages. There is no
/// retry or partial-failure recovery; the only resilience mechanism is
/// the output-exists skip check, which makes re-invocation safe.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("model configuration error: {0}")]
    Model(#[from] ModelError),
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("design error: {0}")]
    Design(#[from] DesignError),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("fitting engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "expected exactly one '{kind}' file for {query:?}, found {}: {candidates:?}",
        candidates.len()
    )]
    AmbiguousInput {
        kind: String,
        query: Entities,
        candidates: Vec<PathBuf>,
    },
    #[error("no '{kind}' file matches {query:?}")]
    MissingResource { kind: String, query: Entities },
    #[error(
        "contrast '{contrast}' references condition '{condition}', which is not a fitted \
         design column (available: {available:?})"
    )]
    UnknownCondition {
        contrast: String,
        condition: String,
        available: Vec<String>,
    },
    #[error("unhandled transformation: {0}")]
    UnsupportedTransform(String),
    #[error("input file name '{0}' does not carry the expected suffix")]
    MalformedInputName(PathBuf),
}

/// The parsed model bound to a merged file index.
#[derive(Debug)]
pub struct Analysis {
    pub model: Model,
    pub index: FileIndex,
    /// Dataset-wide selector entities: the model's `input` section merged
    /// with caller-supplied constraints.
    pub selectors: Entities,
}

impl Analysis {
    /// Builds independent indices over the raw and preprocessed roots,
    /// merges them, and binds the validated model. Selector entities that
    /// match nothing in the merged index are configuration errors.
    pub fn init(
        model_path: &Path,
        raw_root: &Path,
        preproc_root: &Path,
        selectors: Entities,
    ) -> Result<Analysis, RunError> {
        let index = FileIndex::index(raw_root)?.merge(FileIndex::index(preproc_root)?);
        let model = Model::from_file(model_path)?;

        let mut merged = model.input_entities();
        merged.extend(selectors);
        for (entity, value) in &merged {
            if !index.values(entity).iter().any(|v| v == value) {
                return Err(RunError::Model(ModelError::UnresolvableSelector {
                    entity: entity.clone(),
                    value: value.clone(),
                }));
            }
        }

        log::info!(
            "analysis ready: {} indexed files, {} blocks, selectors {:?}",
            index.len(),
            model.blocks.len(),
            merged
        );
        Ok(Analysis {
            model,
            index,
            selectors: merged,
        })
    }

    /// The selector entities that apply to variable (non-image) files.
    /// Events tables carry no `space` entity, so that key is excluded
    /// when locating them.
    pub fn variable_selectors(&self) -> Entities {
        self.selectors
            .iter()
            .filter(|(key, _)| key.as_str() != "space")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// First-level fittable units of a block: one (events table, entity
    /// dictionary) pair per indexed events file matching the selectors.
    pub fn first_level_units(
        &self,
        block: &Block,
    ) -> Result<Vec<(EventsTable, Entities)>, RunError> {
        debug_assert_eq!(block.level, Level::Run);
        let mut units = Vec::new();
        for file in self.index.query("events", &self.variable_selectors()) {
            let events = EventsTable::from_tsv(&file.path)?;
            units.push((events, file.entities.clone()));
        }
        Ok(units)
    }

    /// Group-level units of a block: the entity combinations the block's
    /// level groups over. The design table is built later from the
    /// resolved sample set, so units are entity dictionaries only.
    pub fn group_units(&self, block: &Block) -> Vec<Entities> {
        match block.level {
            Level::Run | Level::Dataset => vec![Entities::new()],
            Level::Subject => self
                .index
                .values("subject")
                .into_iter()
                .map(|subject| {
                    let mut ents = Entities::new();
                    ents.insert("subject".to_string(), subject);
                    ents
                })
                .collect(),
            Level::Session => self
                .index
                .query("events", &self.variable_selectors())
                .iter()
                .filter_map(|file| {
                    let subject = file.entities.get("subject")?;
                    let session = file.entities.get("session")?;
                    Some((subject.clone(), session.clone()))
                })
                .sorted()
                .dedup()
                .map(|(subject, session)| {
                    let mut ents = Entities::new();
                    ents.insert("subject".to_string(), subject);
                    ents.insert("session".to_string(), session);
                    ents
                })
                .collect(),
        }
    }
}
