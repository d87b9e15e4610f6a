//! Pretrained AQI regressor loaded from a JSON model document.
//!
//! The document carries the ordered feature names the model was trained on
//! and one of two estimator shapes: a linear model or a gradient-boosted
//! tree ensemble (sum of tree leaves plus a base score). Trees are stored as
//! flat node arrays where children always sit after their parent, so
//! evaluation always terminates. Each split carries the branch a missing
//! input takes, so tree models can score rows with sensor gaps.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub model_type: String,
    pub feature_names: Vec<String>,
    pub estimator: Estimator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimator {
    Linear {
        intercept: f64,
        coefficients: Vec<f64>,
    },
    TreeEnsemble {
        #[serde(default)]
        base_score: f64,
        trees: Vec<Tree>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

// `x[feature] < threshold` goes left; a missing `x[feature]` follows `default_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default = "missing_goes_left")]
        default_left: bool,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model document: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum PredictError {
    #[error("{}Expected {expected} features, got {got}", row_prefix(.row))]
    FeatureCount {
        row: Option<usize>,
        expected: usize,
        got: usize,
    },
    #[error("{}Features contain NaN or Inf values", row_prefix(.row))]
    NonFiniteInput { row: Option<usize> },
    #[error("Feature {feature} is missing and {model_type} models cannot score gaps")]
    MissingInput { feature: String, model_type: String },
    #[error("Batch cannot be empty")]
    EmptyBatch,
    #[error("Batch size cannot exceed {max}, got {got}")]
    BatchTooLarge { max: usize, got: usize },
    #[error("Model produced invalid prediction")]
    NonFiniteOutput,
}

fn missing_goes_left() -> bool {
    true
}

fn row_prefix(row: &Option<usize>) -> String {
    row.map(|idx| format!("Row {idx}: ")).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub expected_features: usize,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelService {
    document: ModelDocument,
    source: Option<PathBuf>,
}

impl ModelService {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: ModelDocument = serde_json::from_slice(&raw)?;
        let mut service = Self::from_document(document)?;
        service.source = Some(path.to_path_buf());
        Ok(service)
    }

    pub fn from_document(document: ModelDocument) -> Result<Self, ModelError> {
        validate_document(&document)?;
        Ok(Self {
            document,
            source: None,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn expected_features(&self) -> usize {
        self.document.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.document.feature_names
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_type: self.document.model_type.clone(),
            expected_features: self.expected_features(),
            feature_names: self.document.feature_names.clone(),
        }
    }

    pub fn predict(&self, features: &[f64]) -> Result<f64, PredictError> {
        self.validate_row(features, None)?;
        let inputs: Vec<Option<f64>> = features.iter().copied().map(Some).collect();
        self.finish(self.raw_predict(&inputs)?)
    }

    // Scores a feature-table row; `None` marks a column the sensors never filled.
    pub fn predict_with_missing(&self, features: &[Option<f64>]) -> Result<f64, PredictError> {
        let expected = self.expected_features();
        if features.len() != expected {
            return Err(PredictError::FeatureCount {
                row: None,
                expected,
                got: features.len(),
            });
        }
        if features.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PredictError::NonFiniteInput { row: None });
        }
        self.finish(self.raw_predict(features)?)
    }

    // All rows are validated before any is evaluated.
    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, PredictError> {
        if rows.is_empty() {
            return Err(PredictError::EmptyBatch);
        }
        if rows.len() > MAX_BATCH_ROWS {
            return Err(PredictError::BatchTooLarge {
                max: MAX_BATCH_ROWS,
                got: rows.len(),
            });
        }
        for (idx, row) in rows.iter().enumerate() {
            self.validate_row(row, Some(idx))?;
        }
        rows.iter()
            .map(|row| {
                let inputs: Vec<Option<f64>> = row.iter().copied().map(Some).collect();
                self.finish(self.raw_predict(&inputs)?)
            })
            .collect()
    }

    fn validate_row(&self, features: &[f64], row: Option<usize>) -> Result<(), PredictError> {
        let expected = self.expected_features();
        if features.len() != expected {
            return Err(PredictError::FeatureCount {
                row,
                expected,
                got: features.len(),
            });
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(PredictError::NonFiniteInput { row });
        }
        Ok(())
    }

    fn finish(&self, raw: f64) -> Result<f64, PredictError> {
        if !raw.is_finite() {
            return Err(PredictError::NonFiniteOutput);
        }
        Ok(raw.max(0.0))
    }

    fn raw_predict(&self, features: &[Option<f64>]) -> Result<f64, PredictError> {
        match &self.document.estimator {
            Estimator::Linear {
                intercept,
                coefficients,
            } => {
                let mut sum = *intercept;
                for (idx, (w, x)) in coefficients.iter().zip(features).enumerate() {
                    let x = x.ok_or_else(|| PredictError::MissingInput {
                        feature: self.document.feature_names[idx].clone(),
                        model_type: self.document.model_type.clone(),
                    })?;
                    sum += w * x;
                }
                Ok(sum)
            }
            Estimator::TreeEnsemble { base_score, trees } => {
                Ok(base_score + trees.iter().map(|tree| tree.evaluate(features)).sum::<f64>())
            }
        }
    }
}

impl Tree {
    fn evaluate(&self, features: &[Option<f64>]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    default_left,
                } => {
                    let go_left = match features[*feature] {
                        Some(x) => x < *threshold,
                        None => *default_left,
                    };
                    idx = if go_left { *left } else { *right };
                }
            }
        }
    }
}

fn validate_document(document: &ModelDocument) -> Result<(), ModelError> {
    let feature_count = document.feature_names.len();
    if feature_count == 0 {
        return Err(ModelError::Invalid(
            "feature_names must not be empty".to_string(),
        ));
    }

    match &document.estimator {
        Estimator::Linear {
            intercept,
            coefficients,
        } => {
            if coefficients.len() != feature_count {
                return Err(ModelError::Invalid(format!(
                    "linear model has {} coefficients for {feature_count} features",
                    coefficients.len()
                )));
            }
            if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
                return Err(ModelError::Invalid(
                    "linear model parameters must be finite".to_string(),
                ));
            }
        }
        Estimator::TreeEnsemble { base_score, trees } => {
            if !base_score.is_finite() {
                return Err(ModelError::Invalid("base_score must be finite".to_string()));
            }
            if trees.is_empty() {
                return Err(ModelError::Invalid(
                    "tree ensemble has no trees".to_string(),
                ));
            }
            for (t, tree) in trees.iter().enumerate() {
                validate_tree(t, tree, feature_count)?;
            }
        }
    }

    Ok(())
}

fn validate_tree(t: usize, tree: &Tree, feature_count: usize) -> Result<(), ModelError> {
    if tree.nodes.is_empty() {
        return Err(ModelError::Invalid(format!("tree {t} has no nodes")));
    }
    let len = tree.nodes.len();
    for (n, node) in tree.nodes.iter().enumerate() {
        match node {
            TreeNode::Leaf { value } if !value.is_finite() => {
                return Err(ModelError::Invalid(format!(
                    "tree {t} node {n}: leaf value must be finite"
                )));
            }
            TreeNode::Leaf { .. } => {}
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
                ..
            } => {
                if *feature >= feature_count {
                    return Err(ModelError::Invalid(format!(
                        "tree {t} node {n}: feature {feature} out of range"
                    )));
                }
                if threshold.is_nan() {
                    return Err(ModelError::Invalid(format!(
                        "tree {t} node {n}: threshold is NaN"
                    )));
                }
                for child in [*left, *right] {
                    if child <= n || child >= len {
                        return Err(ModelError::Invalid(format!(
                            "tree {t} node {n}: child {child} must follow its parent and exist"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}
