use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use polars::prelude::DataFrame;

use super::{frame_rows, Cell, Warehouse};
use crate::data::load_csv_file;
use crate::schema::{ColumnDef, TableRef};

/// A warehouse kept as one `<SCHEMA>.<TABLE>.csv` file per table.
pub struct CsvWarehouse {
    root: PathBuf,
}

impl CsvWarehouse {
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("local warehouse {} is not a directory", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root.join(format!("{}.{}.csv", table.schema, table.name))
    }

    fn header(&self, table: &TableRef) -> anyhow::Result<Vec<String>> {
        let path = self.table_path(table);
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("table {table} does not exist"))?;
        let header = reader.headers()?.iter().map(str::to_string).collect();
        Ok(header)
    }

    fn write_header(&self, table: &TableRef, columns: &[String]) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(self.table_path(table))?;
        writer.write_record(columns)?;
        writer.flush()?;
        Ok(())
    }
}

impl Warehouse for CsvWarehouse {
    fn read_table(&mut self, table: &TableRef) -> anyhow::Result<DataFrame> {
        load_csv_file(&self.table_path(table)).with_context(|| format!("failed to read {table}"))
    }

    fn recreate_table(&mut self, table: &TableRef, columns: &[ColumnDef]) -> anyhow::Result<()> {
        let path = self.table_path(table);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let names: Vec<String> = columns.iter().map(|c| c.name.to_string()).collect();
        self.write_header(table, &names)
    }

    fn delete_all(&mut self, table: &TableRef) -> anyhow::Result<()> {
        let header = self.header(table)?;
        self.write_header(table, &header)
    }

    fn bulk_insert(&mut self, table: &TableRef, frame: &DataFrame) -> anyhow::Result<usize> {
        let header = self.header(table)?;
        let columns = frame.get_column_names();
        if header != columns {
            anyhow::bail!(
                "frame columns {:?} do not match {} columns {:?}",
                columns,
                table,
                header
            );
        }

        // Render everything before touching the file so a bad column writes nothing
        let rows = frame_rows(frame)?;

        let file = OpenOptions::new()
            .append(true)
            .open(self.table_path(table))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for row in &rows {
            writer.write_record(row.iter().map(|cell| match cell {
                Cell::Null => "",
                Cell::Number(value) | Cell::Text(value) => value.as_str(),
            }))?;
        }
        writer.flush()?;

        Ok(rows.len())
    }
}
