use ndarray::{Array1, Array2};
use polars::prelude::*;

use crate::schema::{ColumnType, PREDICTION_COLUMNS};

pub const PRICE: &str = "price";
pub const PREDICTIONS: &str = "predictions";

// Categorical, location and provenance fields that never reach the model
pub const DROPPED_COLUMNS: [&str; 7] = [
    "date",
    "street",
    "city",
    "statezip",
    "country",
    "PEAKAUDITCREATEDAT",
    "REQUEST_ID",
];

pub const PROVENANCE_COLUMNS: [&str; 2] = ["PEAKAUDITCREATEDAT", "REQUEST_ID"];

pub fn load_csv_file(file_path: &std::path::Path) -> anyhow::Result<DataFrame> {
    let df = CsvReader::from_path(file_path)?.has_header(true).finish()?;

    tracing::debug!(
        "Loaded {} rows and {} columns from {}",
        df.height(),
        df.width(),
        file_path.display()
    );

    Ok(df)
}

/// Keeps only the rows with a strictly positive price. Rows with a null price go too.
pub fn filter_positive_prices(df: &DataFrame) -> anyhow::Result<DataFrame> {
    let mask = df.column(PRICE)?.gt(0)?;
    Ok(df.filter(&mask)?)
}

/// Drops every listed column, failing if one of them is not there.
pub fn drop_columns(df: &DataFrame, columns: &[&str]) -> anyhow::Result<DataFrame> {
    let mut out = df.clone();
    for name in columns {
        out = out.drop(name)?;
    }
    Ok(out)
}

pub fn clean(raw: &DataFrame) -> anyhow::Result<(DataFrame, DataFrame)> {
    let filtered = filter_positive_prices(raw)?;
    let cleaned = drop_columns(&filtered, &DROPPED_COLUMNS)?;
    Ok((filtered, cleaned))
}

pub fn split_features_and_target(df: &DataFrame) -> anyhow::Result<(DataFrame, Series)> {
    let target = df.column(PRICE)?.clone();
    let features = df.drop(PRICE)?;

    Ok((features, target))
}

/// Row-major feature matrix. Every column has to be numeric and complete, anything else
/// means the staging schema changed under us.
pub fn feature_matrix(features: &DataFrame) -> anyhow::Result<Array2<f64>> {
    let mut matrix = Array2::<f64>::zeros((features.height(), features.width()));

    for (j, series) in features.get_columns().iter().enumerate() {
        let values = numeric_values(series)?;
        matrix.column_mut(j).assign(&values);
    }

    Ok(matrix)
}

pub fn target_vector(target: &Series) -> anyhow::Result<Array1<f64>> {
    numeric_values(target)
}

fn numeric_values(series: &Series) -> anyhow::Result<Array1<f64>> {
    // flags come through as 0/1
    let series = match series.dtype() {
        DataType::Boolean => series.cast(&DataType::Float64)?,
        _ => series.clone(),
    };
    if !series.dtype().is_numeric() {
        anyhow::bail!(
            "column `{}` has type {} but the model only takes numeric columns",
            series.name(),
            series.dtype()
        );
    }
    if series.null_count() > 0 {
        anyhow::bail!(
            "column `{}` has {} missing values",
            series.name(),
            series.null_count()
        );
    }

    let floats = series.cast(&DataType::Float64)?;
    Ok(floats.f64()?.into_no_null_iter().collect())
}

/// Builds the frame written to the predictions table: the price-filtered rows without the
/// provenance fields, plus the rounded predictions, with upper-cased column names and the
/// integer columns cast the way the destination table declares them.
pub fn build_publish_frame(
    filtered: &DataFrame,
    predictions: &Array1<f64>,
) -> anyhow::Result<DataFrame> {
    let mut frame = drop_columns(filtered, &PROVENANCE_COLUMNS)?;

    let rounded: Vec<i64> = predictions.iter().map(|p| p.round() as i64).collect();
    frame.with_column(Series::new(PREDICTIONS, rounded))?;

    let upper: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_uppercase())
        .collect();
    frame.set_column_names(&upper)?;

    for column in PREDICTION_COLUMNS
        .iter()
        .filter(|c| c.ty == ColumnType::Integer)
    {
        // astype(int) semantics: truncate toward zero
        let cast = match frame.column(column.name) {
            Ok(series) => series.cast(&DataType::Int64)?,
            Err(_) => continue,
        };
        frame.replace(column.name, cast)?;
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame() -> DataFrame {
        df!(
            "date" => ["2014-05-02", "2014-05-02", "2014-05-03", "2014-05-04"],
            "price" => [313000.0, 0.0, 342000.0, -5.0],
            "bedrooms" => [3.0, 5.0, 3.0, 4.0],
            "bathrooms" => [1.5, 2.5, 2.0, 2.25],
            "sqft_living" => [1340i64, 3650, 1930, 2000],
            "street" => ["18810 Densmore Ave N", "709 W Blaine St", "26206 SE 143rd St", "857 170th Pl NE"],
            "city" => ["Shoreline", "Seattle", "Kent", "Bellevue"],
            "statezip" => ["WA 98133", "WA 98119", "WA 98042", "WA 98008"],
            "country" => ["USA", "USA", "USA", "USA"],
            "PEAKAUDITCREATEDAT" => ["2023-01-01", "2023-01-01", "2023-01-01", "2023-01-01"],
            "REQUEST_ID" => ["a", "b", "c", "d"]
        )
        .unwrap()
    }

    #[test]
    fn non_positive_prices_are_removed() {
        let (filtered, cleaned) = clean(&raw_frame()).unwrap();

        assert_eq!(filtered.height(), 2);
        let prices: Vec<f64> = cleaned
            .column(PRICE)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(prices, vec![313000.0, 342000.0]);
        assert!(prices.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn cleaning_keeps_only_numeric_columns() {
        let (_, cleaned) = clean(&raw_frame()).unwrap();

        assert_eq!(
            cleaned.get_column_names(),
            vec!["price", "bedrooms", "bathrooms", "sqft_living"]
        );
    }

    #[test]
    fn dropping_a_missing_column_fails() {
        let raw = raw_frame().drop("REQUEST_ID").unwrap();
        assert!(clean(&raw).is_err());
    }

    #[test]
    fn text_feature_is_a_type_error() {
        let (_, cleaned) = clean(&raw_frame()).unwrap();
        let mut with_text = cleaned.clone();
        with_text
            .with_column(Series::new("view", ["none", "good"]))
            .unwrap();

        let (features, _) = split_features_and_target(&with_text).unwrap();
        let err = feature_matrix(&features).unwrap_err();
        assert!(err.to_string().contains("view"));
    }

    #[test]
    fn boolean_flags_are_zero_or_one() {
        let features = df!(
            "waterfront" => [true, false, true],
            "sqft_living" => [1340.0, 3650.0, 1930.0]
        )
        .unwrap();

        let x = feature_matrix(&features).unwrap();
        assert_eq!(x.column(0).to_vec(), vec![1.0, 0.0, 1.0]);
        assert_eq!(x.column(1).to_vec(), vec![1340.0, 3650.0, 1930.0]);
    }

    #[test]
    fn feature_matrix_is_row_major() {
        let (_, cleaned) = clean(&raw_frame()).unwrap();
        let (features, target) = split_features_and_target(&cleaned).unwrap();

        let x = feature_matrix(&features).unwrap();
        assert_eq!(x.shape(), &[2, 3]);
        assert_eq!(x[[1, 0]], 3.0);
        assert_eq!(x[[1, 2]], 1930.0);
        assert_eq!(target_vector(&target).unwrap().to_vec(), vec![313000.0, 342000.0]);
    }

    #[test]
    fn publish_frame_is_upper_cased_with_rounded_predictions() {
        let (filtered, _) = clean(&raw_frame()).unwrap();
        let predictions = Array1::from(vec![312450.6, 341999.2]);

        let frame = build_publish_frame(&filtered, &predictions).unwrap();

        assert_eq!(
            frame.get_column_names(),
            vec![
                "DATE",
                "PRICE",
                "BEDROOMS",
                "BATHROOMS",
                "SQFT_LIVING",
                "STREET",
                "CITY",
                "STATEZIP",
                "COUNTRY",
                "PREDICTIONS"
            ]
        );
        let predicted: Vec<i64> = frame
            .column("PREDICTIONS")
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(predicted, vec![312451, 341999]);

        // 1.5 bathrooms is truncated, as the integer column demands
        let bathrooms: Vec<i64> = frame
            .column("BATHROOMS")
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(bathrooms, vec![1, 2]);
    }
}
