//! The declarative analysis model.
//!
//! A model document is JSON: an ordered list of blocks, each bundling a
//! condition vocabulary, contrasts, and transformations. The document is
//! validated on load so that malformed contrasts are rejected before any
//! fitting starts, never mid-run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::Entities;

/// Errors in the model document itself or in how it refers to the indexed
/// dataset. All of these are configuration errors raised at load/init
/// time.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model has no blocks")]
    NoBlocks,
    #[error(
        "contrast '{contrast}' lists {conditions} conditions but {weights} weights; \
         the two lists must pair up positionally"
    )]
    WeightCountMismatch {
        contrast: String,
        conditions: usize,
        weights: usize,
    },
    #[error("contrast '{contrast}' has an empty condition list")]
    EmptyContrast { contrast: String },
    #[error(
        "contrast '{contrast}' references condition '{condition}', which is not in the \
         block's condition vocabulary"
    )]
    UnknownModelCondition { contrast: String, condition: String },
    #[error("selector entity '{entity}' = '{value}' matches nothing in the dataset index")]
    UnresolvableSelector { entity: String, value: String },
}

/// Statistical test type of a contrast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatType {
    T,
    F,
}

/// The level a block operates at: `Run` blocks are first-level (fit over
/// a time series); the rest are group-level (fit over sample images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Run,
    Session,
    Subject,
    Dataset,
}

/// A named linear hypothesis over design-matrix columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contrast {
    pub name: String,
    pub condition_list: Vec<String>,
    pub weights: Vec<f64>,
    #[serde(rename = "type")]
    pub stat_type: StatType,
}

/// A named operator applied to a block's columns before group-level
/// fitting. The only recognized name is `split`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    pub name: String,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub by: Option<String>,
}

/// One stage of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub level: Level,
    /// The block's condition vocabulary. When non-empty, contrast
    /// condition lists are validated against it at load time.
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub contrasts: Vec<Contrast>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

/// The parsed model document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub name: Option<String>,
    /// Dataset-wide selector entities (task, session, space, ...) applied
    /// to every file lookup.
    #[serde(default)]
    pub input: BTreeMap<String, String>,
    pub blocks: Vec<Block>,
}

impl Model {
    /// Loads and validates a model document.
    pub fn from_file(path: &Path) -> Result<Model, ModelError> {
        let text = fs::read_to_string(path)?;
        let model: Model = serde_json::from_str(&text)?;
        model.validate()?;
        Ok(model)
    }

    /// Structural validation: contrasts are well-formed and reference only
    /// conditions the block declares.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.blocks.is_empty() {
            return Err(ModelError::NoBlocks);
        }
        for block in &self.blocks {
            for contrast in &block.contrasts {
                if contrast.condition_list.is_empty() {
                    return Err(ModelError::EmptyContrast {
                        contrast: contrast.name.clone(),
                    });
                }
                if contrast.condition_list.len() != contrast.weights.len() {
                    return Err(ModelError::WeightCountMismatch {
                        contrast: contrast.name.clone(),
                        conditions: contrast.condition_list.len(),
                        weights: contrast.weights.len(),
                    });
                }
                if block.conditions.is_empty() {
                    continue;
                }
                for condition in &contrast.condition_list {
                    // Split-synthesized names ("01.baseline") are resolved
                    // through the transformation mapping at run time.
                    if condition.contains('.') {
                        continue;
                    }
                    if !block.conditions.contains(condition) {
                        return Err(ModelError::UnknownModelCondition {
                            contrast: contrast.name.clone(),
                            condition: condition.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// The model's selector entities as an entity dictionary.
    pub fn input_entities(&self) -> Entities {
        self.input
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
