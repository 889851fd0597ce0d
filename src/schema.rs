use std::fmt;

use polars::prelude::DataFrame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub schema: &'static str,
    pub name: &'static str,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

pub const STAGING_TABLE: TableRef = TableRef {
    schema: "STAGE",
    name: "HOUSEPRICES",
};

pub const PREDICTIONS_TABLE: TableRef = TableRef {
    schema: "PUBLISH",
    name: "HOUSEPRICE_PREDICTIONS",
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Varchar(u32),
    Integer,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Varchar(len) => write!(f, "varchar({len})"),
            ColumnType::Integer => f.write_str("integer"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn varchar(name: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty: ColumnType::Varchar(256),
    }
}

const fn integer(name: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        ty: ColumnType::Integer,
    }
}

/// Destination layout of `PUBLISH.HOUSEPRICE_PREDICTIONS`, in insert order.
pub const PREDICTION_COLUMNS: [ColumnDef; 19] = [
    varchar("DATE"),
    integer("PRICE"),
    integer("BEDROOMS"),
    integer("BATHROOMS"),
    integer("SQFT_LIVING"),
    integer("SQFT_LOT"),
    integer("FLOORS"),
    integer("WATERFRONT"),
    integer("VIEW"),
    integer("CONDITION"),
    integer("SQFT_ABOVE"),
    integer("SQFT_BASEMENT"),
    integer("YR_BUILT"),
    integer("YR_RENOVATED"),
    varchar("STREET"),
    varchar("CITY"),
    varchar("STATEZIP"),
    varchar("COUNTRY"),
    integer("PREDICTIONS"),
];

/// The bulk load is all or nothing, so the frame has to line up with the table before any
/// row goes out.
pub fn ensure_matches(frame: &DataFrame, columns: &[ColumnDef]) -> anyhow::Result<()> {
    let actual = frame.get_column_names();
    let expected: Vec<&str> = columns.iter().map(|c| c.name).collect();

    if actual != expected {
        anyhow::bail!(
            "frame columns {:?} do not match the destination columns {:?}",
            actual,
            expected
        );
    }
    Ok(())
}
