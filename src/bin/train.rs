use clap::Parser;
use house_price_pipeline::config::{init_logging, TrainArgs};
use house_price_pipeline::{run_training_job, storage, warehouse};

// Training job entry point
// Steps
// 1. Connect to the warehouse
// 2. Pull the staging table and clean it
// 3. Fit the linear model
// 4. Write predictions back to the warehouse
// 5. Push the model to the data lake

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = TrainArgs::parse();

    tracing::info!("Starting training job...");

    // 1. Connect to the warehouse, fails straight away on missing credentials
    let mut conn = warehouse::connect(&args.warehouse)?;
    let store = storage::open_store(&args.data_lake)?;

    // 2. - 5.
    let report = run_training_job(conn.as_mut(), store.as_ref(), &args.data_lake.model_key())?;

    tracing::info!(
        "Training finished: {} rows read, {} used for fitting, {} written",
        report.rows_read,
        report.rows_cleaned,
        report.rows_written
    );
    for (feature, coefficient) in report.features.iter().zip(&report.coefficients) {
        tracing::info!("  {feature}: {coefficient}");
    }
    tracing::info!("  intercept: {}", report.intercept);

    Ok(())
}
