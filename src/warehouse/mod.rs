//! Tabular warehouse access used by the training job.
//!
//! The job only needs four things from a warehouse: read a whole table, recreate a table
//! from a fixed layout, empty it, and bulk load a frame into it. [`SnowflakeWarehouse`]
//! speaks to Snowflake, [`CsvWarehouse`] keeps tables as CSV files for local runs.

mod csv_dir;
mod snowflake;

use polars::prelude::*;

use crate::config::WarehouseArgs;
use crate::schema::{ColumnDef, TableRef};

pub use csv_dir::CsvWarehouse;
pub use snowflake::{SnowflakeCredentials, SnowflakeWarehouse};

pub trait Warehouse {
    /// `select * from <table>`, fully materialized.
    fn read_table(&mut self, table: &TableRef) -> anyhow::Result<DataFrame>;

    /// Drops and recreates the table with the given layout.
    fn recreate_table(&mut self, table: &TableRef, columns: &[ColumnDef]) -> anyhow::Result<()>;

    fn delete_all(&mut self, table: &TableRef) -> anyhow::Result<()>;

    /// Loads every row of `frame` or none of them. Returns the number of rows written.
    fn bulk_insert(&mut self, table: &TableRef, frame: &DataFrame) -> anyhow::Result<usize>;
}

/// Opens the warehouse named by the configuration. A local directory wins over Snowflake.
pub fn connect(args: &WarehouseArgs) -> anyhow::Result<Box<dyn Warehouse>> {
    if let Some(dir) = &args.local_warehouse_dir {
        tracing::info!("Using local warehouse at {}", dir.display());
        return Ok(Box::new(CsvWarehouse::open(dir)?));
    }

    let credentials = SnowflakeCredentials::from_args(args)?;
    Ok(Box::new(SnowflakeWarehouse::connect(&credentials)?))
}

/// One cell of a frame, rendered for a text-based sink.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    Null,
    Number(String),
    Text(String),
}

/// Row-major rendering of a frame.
pub(crate) fn frame_rows(frame: &DataFrame) -> anyhow::Result<Vec<Vec<Cell>>> {
    let columns = frame
        .get_columns()
        .iter()
        .map(column_cells)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut rows: Vec<Vec<Cell>> = (0..frame.height())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, cell) in rows.iter_mut().zip(column) {
            row.push(cell);
        }
    }
    Ok(rows)
}

fn column_cells(series: &Series) -> anyhow::Result<Vec<Cell>> {
    let dtype = series.dtype();

    let cells = if dtype.is_integer() {
        let ints = series.cast(&DataType::Int64)?;
        ints.i64()?
            .into_iter()
            .map(|v| v.map_or(Cell::Null, |v| Cell::Number(v.to_string())))
            .collect()
    } else if dtype.is_float() {
        let floats = series.cast(&DataType::Float64)?;
        floats
            .f64()?
            .into_iter()
            .map(|v| v.map_or(Cell::Null, |v| Cell::Number(v.to_string())))
            .collect()
    } else {
        match dtype {
            DataType::Utf8 => series
                .utf8()?
                .into_iter()
                .map(|v| v.map_or(Cell::Null, |v| Cell::Text(v.to_string())))
                .collect(),
            DataType::Boolean => series
                .bool()?
                .into_iter()
                .map(|v| v.map_or(Cell::Null, |v| Cell::Number(u8::from(v).to_string())))
                .collect(),
            other => anyhow::bail!(
                "column `{}` has type {} which cannot be written to the warehouse",
                series.name(),
                other
            ),
        }
    };

    Ok(cells)
}
