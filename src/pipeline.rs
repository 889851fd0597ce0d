use polars::prelude::DataFrame;

use crate::data::{build_publish_frame, clean, split_features_and_target};
use crate::model::train_linear_model;
use crate::schema::{ensure_matches, PREDICTIONS_TABLE, PREDICTION_COLUMNS, STAGING_TABLE};
use crate::storage::ArtifactStore;
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub rows_read: usize,
    pub rows_cleaned: usize,
    pub rows_written: usize,
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub artifact_key: String,
}

// Training job, start to finish
// 1. Read the staging table
// 2. Clean it
// 3. Fit the regression
// 4. Score the same rows
// 5. Replace the predictions table
// 6. Upload the model
// Any failure stops the run where it is, nothing already written gets undone
pub fn run_training_job(
    warehouse: &mut dyn Warehouse,
    store: &dyn ArtifactStore,
    model_key: &str,
) -> anyhow::Result<TrainingReport> {
    tracing::info!("Querying warehouse data");
    let raw = warehouse.read_table(&STAGING_TABLE)?;
    tracing::info!("Read {} rows from {}", raw.height(), STAGING_TABLE);

    tracing::info!("Pre-processing data");
    let (filtered, cleaned) = clean(&raw)?;
    let (features, target) = split_features_and_target(&cleaned)?;

    tracing::info!("Build model and add predictions to dataset");
    let artifact = train_linear_model(&features, &target)?;
    let predictions = artifact.predict_frame(&features)?;

    tracing::info!("Changing datatypes to match the predictions table");
    let publish = build_publish_frame(&filtered, &predictions)?;

    tracing::info!("Writing predictions data to {}", PREDICTIONS_TABLE);
    let rows_written = publish_predictions(warehouse, &publish)?;
    tracing::info!("Number of successful rows {}", rows_written);

    tracing::info!("Save model to {}", model_key);
    store.put(model_key, artifact.to_bytes()?)?;

    Ok(TrainingReport {
        rows_read: raw.height(),
        rows_cleaned: cleaned.height(),
        rows_written,
        features: artifact.features.clone(),
        coefficients: artifact.coefficients().to_vec(),
        intercept: artifact.intercept(),
        artifact_key: model_key.to_string(),
    })
}

/// Replaces the whole predictions table with `frame`.
pub fn publish_predictions(
    warehouse: &mut dyn Warehouse,
    frame: &DataFrame,
) -> anyhow::Result<usize> {
    ensure_matches(frame, &PREDICTION_COLUMNS)?;

    warehouse.recreate_table(&PREDICTIONS_TABLE, &PREDICTION_COLUMNS)?;
    // No-op right after a recreate; the load has always been preceded by a delete
    warehouse.delete_all(&PREDICTIONS_TABLE)?;

    warehouse.bulk_insert(&PREDICTIONS_TABLE, frame)
}
