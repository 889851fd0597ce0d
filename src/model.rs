use std::collections::HashMap;

use anyhow::Context;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use polars::prelude::{DataFrame, Series};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{feature_matrix, target_vector, PRICE};

/// Bumped whenever the artifact layout or the feature contract changes.
pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

/// A request record that does not line up with the features the model was fitted on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureMismatch {
    #[error("missing feature `{0}`")]
    Missing(String),
    #[error("unexpected feature `{0}`")]
    Unexpected(String),
}

/// Coefficients and intercept of an ordinary least squares fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    params: Array1<f64>,
    intercept: f64,
}

impl LinearFit {
    /// Least squares of `y` on `x` plus an intercept.
    ///
    /// Both sides are centered and the slope comes from an SVD pseudo-inverse, so a
    /// constant or duplicated column gets the minimum-norm solution instead of failing.
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>) -> anyhow::Result<Self> {
        let (rows, cols) = x.dim();
        if cols == 0 {
            anyhow::bail!("no feature columns to fit on");
        }

        let x_mean = x
            .mean_axis(Axis(0))
            .context("no rows left to fit on after cleaning")?;
        let y_mean = y.mean().context("no rows left to fit on after cleaning")?;

        let a = DMatrix::from_fn(rows, cols, |i, j| x[[i, j]] - x_mean[j]);
        let b = DVector::from_iterator(rows, y.iter().map(|v| v - y_mean));

        let svd = a.svd(true, true);
        // Same cutoff as LAPACK's gelsd with the default rcond
        let tolerance = svd.singular_values.max() * f64::EPSILON * rows.max(cols) as f64;
        let solution = svd
            .solve(&b, tolerance)
            .map_err(|e| anyhow::anyhow!("least squares solve failed: {e}"))?;

        let params: Array1<f64> = solution.iter().copied().collect();
        let intercept = y_mean - params.dot(&x_mean);
        Ok(Self { params, intercept })
    }

    pub fn params(&self) -> &Array1<f64> {
        &self.params
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.params) + self.intercept
    }
}

/// What gets uploaded to the data lake: the fitted regression together with the ordered
/// feature names it expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema_version: u32,
    pub target: String,
    pub features: Vec<String>,
    model: LinearFit,
}

// Fits ordinary least squares of the target on every feature column
// No split and no hyperparameters, the same input always gives the same coefficients
pub fn train_linear_model(features: &DataFrame, target: &Series) -> anyhow::Result<ModelArtifact> {
    if features.height() == 0 {
        anyhow::bail!("no rows left to fit on after cleaning");
    }

    let x: Array2<f64> = feature_matrix(features)?;
    let y: Array1<f64> = target_vector(target)?;
    let model = LinearFit::fit(&x, &y)?;

    Ok(ModelArtifact {
        schema_version: ARTIFACT_SCHEMA_VERSION,
        target: PRICE.to_string(),
        features: features
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect(),
        model,
    })
}

impl ModelArtifact {
    pub fn coefficients(&self) -> &Array1<f64> {
        self.model.params()
    }

    pub fn intercept(&self) -> f64 {
        self.model.intercept()
    }

    /// Scores a whole frame. The columns must be exactly the fitted features, in order.
    pub fn predict_frame(&self, features: &DataFrame) -> anyhow::Result<Array1<f64>> {
        let names = features.get_column_names();
        if names != self.features {
            anyhow::bail!(
                "feature columns {:?} differ from the fitted features {:?}",
                names,
                self.features
            );
        }

        let x = feature_matrix(features)?;
        Ok(self.model.predict(&x))
    }

    /// Scores a single record keyed by feature name. Nothing is defaulted: a missing or
    /// unknown feature is an error.
    pub fn predict_record(&self, record: &HashMap<String, f64>) -> Result<f64, FeatureMismatch> {
        let mut row = Vec::with_capacity(self.features.len());
        for name in &self.features {
            match record.get(name) {
                Some(value) => row.push(*value),
                None => return Err(FeatureMismatch::Missing(name.clone())),
            }
        }

        if let Some(extra) = record.keys().find(|key| !self.features.contains(key)) {
            return Err(FeatureMismatch::Unexpected(extra.clone()));
        }

        let x = Array1::from(row);
        Ok(x.dot(self.model.params()) + self.model.intercept())
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize the model artifact")
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let artifact: ModelArtifact =
            bincode::deserialize(bytes).context("model artifact is corrupt")?;

        if artifact.schema_version != ARTIFACT_SCHEMA_VERSION {
            anyhow::bail!(
                "model artifact has schema version {}, expected {}",
                artifact.schema_version,
                ARTIFACT_SCHEMA_VERSION
            );
        }
        Ok(artifact)
    }
}
