use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use flate2::read::GzDecoder;
use polars::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{frame_rows, Cell, Warehouse};
use crate::config::WarehouseArgs;
use crate::schema::{ColumnDef, TableRef};

const CLIENT_APP_ID: &str = "house-price-pipeline";

// Snowflake accepts up to 16384 rows in one VALUES list
const INSERT_BATCH_ROWS: usize = 1000;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

// "query still running" codes returned by the query endpoint
const QUERY_IN_PROGRESS: [&str; 2] = ["333333", "333334"];

// 1970-01-01 counted from 0001-01-01 as day 1
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

// timestamp_tz offsets arrive in minutes, shifted by a day
const TZ_OFFSET_BIAS_MINUTES: i32 = 1440;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

type Rows = Vec<Vec<Option<String>>>;

pub struct SnowflakeCredentials {
    pub user: String,
    pub password: String,
    pub account: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
}

impl SnowflakeCredentials {
    pub fn from_args(args: &WarehouseArgs) -> anyhow::Result<Self> {
        fn required(value: &Option<String>, var: &str) -> anyhow::Result<String> {
            value
                .clone()
                .with_context(|| format!("missing warehouse credential {var}"))
        }

        Ok(Self {
            user: required(&args.user, "SNOWFLAKE_USERNAME")?,
            password: required(&args.password, "SNOWFLAKE_PASSWORD")?,
            account: required(&args.account, "SNOWFLAKE_ACCOUNT")?,
            warehouse: required(&args.warehouse, "SNOWFLAKE_WAREHOUSE")?,
            database: required(&args.database, "SNOWFLAKE_DATABASE")?,
            schema: required(&args.schema, "SNOWFLAKE_SCHEMA")?,
        })
    }
}

/// One authenticated Snowflake session driven over the connector REST endpoints.
pub struct SnowflakeWarehouse {
    http: Client,
    base_url: String,
    token: String,
    sequence_id: u64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    success: bool,
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl<T> Envelope<T> {
    fn code(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(code)) => Some(code.clone()),
            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }

    fn in_progress(&self) -> bool {
        self.code()
            .map_or(false, |code| QUERY_IN_PROGRESS.contains(&code.as_str()))
    }

    fn into_data(self, what: &str) -> anyhow::Result<T> {
        if !self.success {
            let code = self.code().unwrap_or_default();
            anyhow::bail!(
                "{what} failed ({code}): {}",
                self.message.unwrap_or_else(|| "no message".to_string())
            );
        }
        self.data
            .with_context(|| format!("{what} response carried no data"))
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    #[serde(default)]
    rowset: Rows,
    #[serde(default)]
    chunks: Vec<Chunk>,
    chunk_headers: Option<HashMap<String, String>>,
    qrmk: Option<String>,
    query_result_format: Option<String>,
    get_result_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    scale: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chunk {
    url: String,
    row_count: usize,
}

impl SnowflakeWarehouse {
    pub fn connect(credentials: &SnowflakeCredentials) -> anyhow::Result<Self> {
        let base_url = format!("https://{}.snowflakecomputing.com", credentials.account);
        Self::login(base_url, credentials)
    }

    pub(crate) fn login(
        base_url: String,
        credentials: &SnowflakeCredentials,
    ) -> anyhow::Result<Self> {
        // Full-table reads and bulk loads run as long as they need to
        let http = Client::builder().timeout(None).build()?;

        let account_name = credentials
            .account
            .split('.')
            .next()
            .unwrap_or(&credentials.account)
            .to_uppercase();
        let body = json!({
            "data": {
                "CLIENT_APP_ID": CLIENT_APP_ID,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": account_name,
                "LOGIN_NAME": credentials.user,
                "PASSWORD": credentials.password,
                "SESSION_PARAMETERS": {
                    "QUERY_RESULT_FORMAT": "JSON",
                },
            }
        });
        let request_id = Uuid::new_v4().to_string();

        let envelope: Envelope<LoginData> = http
            .post(format!("{base_url}/session/v1/login-request"))
            .query(&[
                ("warehouse", credentials.warehouse.as_str()),
                ("databaseName", credentials.database.as_str()),
                ("schemaName", credentials.schema.as_str()),
                ("request_id", request_id.as_str()),
            ])
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .context("could not reach Snowflake")?
            .error_for_status()?
            .json()?;

        let token = envelope
            .into_data("Snowflake login")?
            .token
            .context("Snowflake login returned no session token")?;

        tracing::info!("Connected to Snowflake account {}", credentials.account);

        Ok(Self {
            http,
            base_url,
            token,
            sequence_id: 0,
        })
    }

    fn auth_header(&self) -> String {
        format!("Snowflake Token=\"{}\"", self.token)
    }

    fn execute(&mut self, sql: &str) -> anyhow::Result<QueryData> {
        self.sequence_id += 1;
        let request_id = Uuid::new_v4().to_string();
        let submitted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": self.sequence_id,
            "querySubmissionTime": submitted_at,
        });

        let mut envelope: Envelope<QueryData> = self
            .http
            .post(format!("{}/queries/v1/query-request", self.base_url))
            .query(&[("requestId", request_id.as_str())])
            .header(ACCEPT, "application/snowflake")
            .header(AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;

        while envelope.in_progress() {
            let url = envelope
                .data
                .as_ref()
                .and_then(|data| data.get_result_url.clone())
                .context("running query came back without a result url")?;
            std::thread::sleep(POLL_INTERVAL);

            envelope = self
                .http
                .get(format!("{}{}", self.base_url, url))
                .header(ACCEPT, "application/snowflake")
                .header(AUTHORIZATION, self.auth_header())
                .send()?
                .error_for_status()?
                .json()?;
        }

        envelope
            .into_data("query")
            .with_context(|| format!("statement failed: {}", first_line(sql)))
    }

    fn fetch_chunk(&self, chunk: &Chunk, headers: &HeaderMap) -> anyhow::Result<Rows> {
        let bytes = self
            .http
            .get(&chunk.url)
            .headers(headers.clone())
            .send()?
            .error_for_status()?
            .bytes()?;

        let rows = parse_chunk(&bytes)?;
        if rows.len() != chunk.row_count {
            anyhow::bail!(
                "result chunk has {} rows, expected {}",
                rows.len(),
                chunk.row_count
            );
        }
        Ok(rows)
    }

    fn insert_batches(&mut self, table: &TableRef, frame: &DataFrame) -> anyhow::Result<usize> {
        let columns = frame.get_column_names().join(", ");
        let rows = frame_rows(frame)?;

        let mut written = 0;
        for batch in rows.chunks(INSERT_BATCH_ROWS) {
            let data = self.execute(&insert_sql(table, &columns, batch))?;
            written += rows_affected(&data)?;
        }
        Ok(written)
    }
}

impl Warehouse for SnowflakeWarehouse {
    fn read_table(&mut self, table: &TableRef) -> anyhow::Result<DataFrame> {
        let data = self.execute(&format!("select * from {table}"))?;

        if let Some(format) = &data.query_result_format {
            if !format.eq_ignore_ascii_case("json") {
                anyhow::bail!("unsupported Snowflake result format `{format}`");
            }
        }

        let headers = chunk_headers(&data)?;
        let mut rows = data.rowset;
        for chunk in &data.chunks {
            rows.extend(self.fetch_chunk(chunk, &headers)?);
        }

        frame_from_rowset(&data.rowtype, rows)
    }

    fn recreate_table(&mut self, table: &TableRef, columns: &[ColumnDef]) -> anyhow::Result<()> {
        self.execute(&create_table_sql(table, columns))?;
        Ok(())
    }

    fn delete_all(&mut self, table: &TableRef) -> anyhow::Result<()> {
        self.execute(&format!("delete from {table}"))?;
        Ok(())
    }

    fn bulk_insert(&mut self, table: &TableRef, frame: &DataFrame) -> anyhow::Result<usize> {
        self.execute("begin")?;
        match self.insert_batches(table, frame) {
            Ok(written) => {
                self.execute("commit")?;
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback) = self.execute("rollback") {
                    tracing::warn!("rollback of {table} failed: {rollback:#}");
                }
                Err(err)
            }
        }
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

fn create_table_sql(table: &TableRef, columns: &[ColumnDef]) -> String {
    let body = columns
        .iter()
        .map(|c| format!("  {} {}", c.name, c.ty))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE OR REPLACE TABLE {table} (\n{body}\n)")
}

fn insert_sql(table: &TableRef, columns: &str, rows: &[Vec<Cell>]) -> String {
    let values = rows
        .iter()
        .map(|row| {
            let literals: Vec<String> = row.iter().map(sql_literal).collect();
            format!("({})", literals.join(", "))
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("INSERT INTO {table} ({columns}) VALUES\n{values}")
}

fn sql_literal(cell: &Cell) -> String {
    match cell {
        Cell::Null => "NULL".to_string(),
        Cell::Number(value) => value.clone(),
        Cell::Text(value) => format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''")),
    }
}

// DML answers with a single row holding the affected row count
fn rows_affected(data: &QueryData) -> anyhow::Result<usize> {
    let count = data
        .rowset
        .first()
        .and_then(|row| row.first())
        .and_then(|cell| cell.as_deref())
        .context("insert did not report a row count")?;
    Ok(count.parse()?)
}

fn chunk_headers(data: &QueryData) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(chunk_headers) = &data.chunk_headers {
        for (name, value) in chunk_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
    } else if let Some(qrmk) = &data.qrmk {
        headers.insert(
            "x-amz-server-side-encryption-customer-algorithm",
            HeaderValue::from_static("AES256"),
        );
        headers.insert(
            "x-amz-server-side-encryption-customer-key",
            HeaderValue::from_str(qrmk)?,
        );
    }
    Ok(headers)
}

// Chunks are a comma separated run of JSON arrays, usually gzipped
fn parse_chunk(bytes: &[u8]) -> anyhow::Result<Rows> {
    let text = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text)?;
        text
    } else {
        String::from_utf8(bytes.to_vec())?
    };

    let rows = serde_json::from_str(&format!("[{text}]")).context("malformed result chunk")?;
    Ok(rows)
}

fn parse_cells<T>(name: &str, cells: &[Option<&str>]) -> anyhow::Result<Vec<Option<T>>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    cells
        .iter()
        .map(|&cell| {
            cell.map(|value| {
                value
                    .parse::<T>()
                    .with_context(|| format!("bad value `{value}` in column `{name}`"))
            })
            .transpose()
        })
        .collect()
}

fn parse_bools(name: &str, cells: &[Option<&str>]) -> anyhow::Result<Vec<Option<bool>>> {
    cells
        .iter()
        .map(|cell| match *cell {
            None => Ok(None),
            Some("1") | Some("true") | Some("TRUE") => Ok(Some(true)),
            Some("0") | Some("false") | Some("FALSE") => Ok(Some(false)),
            Some(other) => anyhow::bail!("bad value `{other}` in boolean column `{name}`"),
        })
        .collect()
}

// `seconds.nanos`, where a leading minus applies to the fraction too
fn split_epoch(value: &str) -> anyhow::Result<(i64, u32)> {
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    let mut seconds: i64 = whole.parse()?;

    let digits = fraction.len().min(9);
    let mut nanos: u32 = match fraction.get(..digits) {
        Some("") => 0,
        Some(digits_text) => digits_text.parse::<u32>()? * 10u32.pow((9 - digits) as u32),
        None => anyhow::bail!("bad fraction in `{value}`"),
    };

    if value.starts_with('-') && nanos > 0 {
        seconds -= 1;
        nanos = 1_000_000_000 - nanos;
    }
    Ok((seconds, nanos))
}

fn utc_timestamp(value: &str) -> anyhow::Result<DateTime<chrono::Utc>> {
    let (seconds, nanos) = split_epoch(value)?;
    DateTime::from_timestamp(seconds, nanos).context("timestamp out of range")
}

/// Renders a JSON-format temporal value as ISO text.
fn decode_temporal(kind: &str, value: &str) -> anyhow::Result<String> {
    match kind {
        "date" => {
            let days: i32 = value.parse()?;
            let date = days
                .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .context("date out of range")?;
            Ok(date.format("%Y-%m-%d").to_string())
        }
        "time" => {
            let (seconds, nanos) = split_epoch(value)?;
            let seconds = u32::try_from(seconds)?;
            let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
                .context("time out of range")?;
            Ok(time.format("%H:%M:%S%.f").to_string())
        }
        "timestamp_ntz" | "timestamp_ltz" => {
            let timestamp = utc_timestamp(value)?.naive_utc();
            Ok(timestamp.format(TIMESTAMP_FORMAT).to_string())
        }
        "timestamp_tz" => {
            let (epoch, offset) = value
                .split_once(' ')
                .context("timestamp_tz value without an offset")?;
            let minutes: i32 = offset.trim().parse()?;
            let offset = FixedOffset::east_opt((minutes - TZ_OFFSET_BIAS_MINUTES) * 60)
                .context("time zone offset out of range")?;

            let local = utc_timestamp(epoch)?.with_timezone(&offset);
            Ok(local.format("%Y-%m-%d %H:%M:%S%.f %:z").to_string())
        }
        other => anyhow::bail!("`{other}` is not a temporal type"),
    }
}

fn parse_temporal(
    name: &str,
    kind: &str,
    cells: &[Option<&str>],
) -> anyhow::Result<Vec<Option<String>>> {
    cells
        .iter()
        .map(|&cell| {
            cell.map(|value| {
                decode_temporal(kind, value)
                    .with_context(|| format!("bad {kind} value `{value}` in column `{name}`"))
            })
            .transpose()
        })
        .collect()
}

fn frame_from_rowset(rowtype: &[RowType], rows: Rows) -> anyhow::Result<DataFrame> {
    if let Some(row) = rows.iter().find(|row| row.len() != rowtype.len()) {
        anyhow::bail!(
            "result row has {} values but the result has {} columns",
            row.len(),
            rowtype.len()
        );
    }

    let mut columns = Vec::with_capacity(rowtype.len());
    for (j, column) in rowtype.iter().enumerate() {
        let cells: Vec<Option<&str>> = rows.iter().map(|row| row[j].as_deref()).collect();
        let name = column.name.as_str();

        let series = match column.kind.as_str() {
            "fixed" if column.scale.unwrap_or(0) == 0 => {
                Series::new(name, parse_cells::<i64>(name, &cells)?)
            }
            "fixed" | "real" => Series::new(name, parse_cells::<f64>(name, &cells)?),
            "boolean" => Series::new(name, parse_bools(name, &cells)?),
            "date" | "time" | "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => {
                Series::new(name, parse_temporal(name, &column.kind, &cells)?)
            }
            _ => Series::new(name, cells),
        };
        columns.push(series);
    }

    Ok(DataFrame::new(columns)?)
}
