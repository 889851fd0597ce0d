use std::path::Path;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use house_price_pipeline::api::{load_model, router};
use house_price_pipeline::run_training_job;
use house_price_pipeline::schema::{PREDICTIONS_TABLE, PREDICTION_COLUMNS, STAGING_TABLE};
use house_price_pipeline::storage::{ArtifactStore, LocalStore};
use house_price_pipeline::warehouse::{CsvWarehouse, Warehouse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tower::ServiceExt;

const MODEL_KEY: &str = "prod/datascience/model.pkl";

const STAGING_HEADER: [&str; 20] = [
    "date",
    "price",
    "bedrooms",
    "bathrooms",
    "sqft_living",
    "sqft_lot",
    "floors",
    "waterfront",
    "view",
    "condition",
    "sqft_above",
    "sqft_basement",
    "yr_built",
    "yr_renovated",
    "street",
    "city",
    "statezip",
    "country",
    "PEAKAUDITCREATEDAT",
    "REQUEST_ID",
];

const CITIES: [&str; 4] = ["Seattle", "Kent", "Bellevue", "Redmond"];

/// Writes `rows` synthetic houses to the staging table, plus two with a price that must
/// be filtered out. Returns the number of houses with a positive price.
fn write_staging(dir: &Path, rows: usize, skip_column: Option<&str>) -> usize {
    let mut rng = StdRng::seed_from_u64(1995);
    let path = dir.join(format!("{}.{}.csv", STAGING_TABLE.schema, STAGING_TABLE.name));
    let mut writer = csv::Writer::from_path(path).unwrap();

    let keep: Vec<usize> = (0..STAGING_HEADER.len())
        .filter(|&i| Some(STAGING_HEADER[i]) != skip_column)
        .collect();
    writer
        .write_record(keep.iter().map(|&i| STAGING_HEADER[i]))
        .unwrap();

    for n in 0..rows + 2 {
        let bedrooms: u32 = rng.gen_range(1..=6);
        let bathrooms = f64::from(rng.gen_range(4..=16u32)) * 0.25;
        let sqft_above: u32 = rng.gen_range(600..=3500);
        let sqft_basement: u32 = if rng.gen_bool(0.4) {
            rng.gen_range(200..=1200)
        } else {
            0
        };
        let sqft_living = sqft_above + sqft_basement + rng.gen_range(0..=150);
        let sqft_lot: u32 = rng.gen_range(2000..=20000);
        let floors = f64::from(rng.gen_range(2..=6u32)) * 0.5;
        let waterfront: u32 = u32::from(rng.gen_bool(0.05));
        let view: u32 = rng.gen_range(0..=4);
        let condition: u32 = rng.gen_range(1..=5);
        let yr_built: u32 = rng.gen_range(1900..=2014);
        let yr_renovated: u32 = if rng.gen_bool(0.3) {
            rng.gen_range(yr_built..=2014)
        } else {
            0
        };

        let mut price = 40_000.0
            + 180.0 * f64::from(sqft_living)
            + 9_000.0 * f64::from(bedrooms)
            + 15_000.0 * bathrooms
            + 120_000.0 * f64::from(waterfront)
            + 7_500.0 * f64::from(view)
            + rng.gen_range(-10_000.0..10_000.0);
        if n == 3 {
            price = 0.0;
        } else if n == 7 {
            price = -1.0;
        }

        let city = CITIES[n % CITIES.len()];
        let record = [
            "2014-05-02 00:00:00".to_string(),
            format!("{price:.1}"),
            format!("{bedrooms}.0"),
            format!("{bathrooms:.2}"),
            sqft_living.to_string(),
            sqft_lot.to_string(),
            format!("{floors:.1}"),
            waterfront.to_string(),
            view.to_string(),
            condition.to_string(),
            sqft_above.to_string(),
            sqft_basement.to_string(),
            yr_built.to_string(),
            yr_renovated.to_string(),
            format!("{} {} Ave NE", 100 + n, city),
            city.to_string(),
            "WA 98052".to_string(),
            "USA".to_string(),
            "2023-06-01 09:00:00".to_string(),
            format!("req-{n:05}"),
        ];
        writer
            .write_record(keep.iter().map(|&i| record[i].as_str()))
            .unwrap();
    }
    writer.flush().unwrap();

    rows
}

fn predict_request(body: &str) -> Request<Body> {
    Request::post("/get_house_prices")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[test]
fn training_publishes_predictions_and_the_model() {
    let warehouse_dir = tempfile::tempdir().unwrap();
    let lake_dir = tempfile::tempdir().unwrap();
    let positive = write_staging(warehouse_dir.path(), 200, None);

    let mut warehouse = CsvWarehouse::open(warehouse_dir.path()).unwrap();
    let store = LocalStore::new(lake_dir.path());

    let report = run_training_job(&mut warehouse, &store, MODEL_KEY).unwrap();

    assert_eq!(report.rows_read, positive + 2);
    assert_eq!(report.rows_cleaned, positive);
    assert_eq!(report.rows_written, positive);
    assert_eq!(report.features.len(), 12);
    assert!(!report.features.iter().any(|f| f == "price"));

    let published = warehouse.read_table(&PREDICTIONS_TABLE).unwrap();
    let expected: Vec<&str> = PREDICTION_COLUMNS.iter().map(|c| c.name).collect();
    assert_eq!(published.get_column_names(), expected);
    assert_eq!(published.height(), positive);

    let prices = published.column("PRICE").unwrap();
    assert!(prices
        .i64()
        .unwrap()
        .into_no_null_iter()
        .all(|price| price > 0));

    assert!(lake_dir.path().join(MODEL_KEY).is_file());
}

#[test]
fn rerunning_on_the_same_data_is_deterministic() {
    let warehouse_dir = tempfile::tempdir().unwrap();
    let lake_dir = tempfile::tempdir().unwrap();
    write_staging(warehouse_dir.path(), 120, None);

    let mut warehouse = CsvWarehouse::open(warehouse_dir.path()).unwrap();
    let store = LocalStore::new(lake_dir.path());

    let first = run_training_job(&mut warehouse, &store, MODEL_KEY).unwrap();
    let second = run_training_job(&mut warehouse, &store, MODEL_KEY).unwrap();

    assert_eq!(first.coefficients, second.coefficients);
    assert_eq!(first.intercept, second.intercept);
    assert_eq!(first.rows_written, second.rows_written);

    // the table is replaced, not appended to
    let published = warehouse.read_table(&PREDICTIONS_TABLE).unwrap();
    assert_eq!(published.height(), second.rows_written);
}

#[test]
fn staging_without_a_dropped_column_aborts_before_publishing() {
    let warehouse_dir = tempfile::tempdir().unwrap();
    let lake_dir = tempfile::tempdir().unwrap();
    write_staging(warehouse_dir.path(), 50, Some("REQUEST_ID"));

    let mut warehouse = CsvWarehouse::open(warehouse_dir.path()).unwrap();
    let store = LocalStore::new(lake_dir.path());

    assert!(run_training_job(&mut warehouse, &store, MODEL_KEY).is_err());
    assert!(warehouse.read_table(&PREDICTIONS_TABLE).is_err());
    assert!(store.get(MODEL_KEY).is_err());
}

#[test]
fn staging_that_no_longer_matches_the_destination_writes_nothing() {
    let warehouse_dir = tempfile::tempdir().unwrap();
    let lake_dir = tempfile::tempdir().unwrap();
    write_staging(warehouse_dir.path(), 50, Some("sqft_lot"));

    let mut warehouse = CsvWarehouse::open(warehouse_dir.path()).unwrap();
    let store = LocalStore::new(lake_dir.path());

    let err = run_training_job(&mut warehouse, &store, MODEL_KEY).unwrap_err();
    assert!(err.to_string().contains("destination columns"));
    assert!(warehouse.read_table(&PREDICTIONS_TABLE).is_err());
    assert!(store.get(MODEL_KEY).is_err());
}

#[tokio::test]
async fn the_published_model_serves_predictions() {
    let warehouse_dir = tempfile::tempdir().unwrap();
    let lake_dir = tempfile::tempdir().unwrap();
    write_staging(warehouse_dir.path(), 300, None);

    let mut warehouse = CsvWarehouse::open(warehouse_dir.path()).unwrap();
    let store = LocalStore::new(lake_dir.path());
    run_training_job(&mut warehouse, &store, MODEL_KEY).unwrap();

    let model = load_model(&store, MODEL_KEY).unwrap();

    let response = router(model.clone())
        .oneshot(predict_request(
            r#"{"bedrooms": 3, "bathrooms": 2, "sqft_living": 1800, "sqft_lot": 5000,
                "floors": 1, "waterfront": 0, "view": 0, "condition": 3,
                "sqft_above": 1800, "sqft_basement": 0, "yr_built": 1995, "yr_renovated": 0}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let amount = body
        .strip_prefix("{'predicted_price': £")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap();
    assert!(!amount.is_empty());
    assert!(amount.chars().all(|c| c.is_ascii_digit() || c == ','));
    let groups: Vec<&str> = amount.split(',').collect();
    assert!(groups[1..].iter().all(|g| g.len() == 3));

    let missing = router(model)
        .oneshot(predict_request(r#"{"bedrooms": 3, "sqft_living": 1800}"#))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
