//! Command line and environment configuration shared by the `train` and `api` binaries.
//!
//! Every setting can come from a flag or from the environment variable the deployment
//! already exports.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

/// Where the serialized model lives, relative to the data lake root.
pub const MODEL_KEY_SUFFIX: &str = "datascience/model.pkl";

#[derive(Debug, Clone, Args)]
pub struct DataLakeArgs {
    /// S3 bucket of the data lake
    #[arg(
        long = "data-lake",
        env = "DATA_LAKE",
        required_unless_present = "local_artifact_dir"
    )]
    pub bucket: Option<String>,

    /// Prefix prepended verbatim to every key, normally ending in `/`
    #[arg(long = "data-lake-root-path", env = "DATA_LAKE_ROOT_PATH")]
    pub root_path: String,

    /// Keep artifacts in this directory instead of S3
    #[arg(long, env = "LOCAL_ARTIFACT_DIR")]
    pub local_artifact_dir: Option<PathBuf>,
}

impl DataLakeArgs {
    pub fn model_key(&self) -> String {
        format!("{}{}", self.root_path, MODEL_KEY_SUFFIX)
    }
}

#[derive(Debug, Clone, Args)]
pub struct WarehouseArgs {
    /// Read and write tables as CSV files in this directory instead of Snowflake
    #[arg(long, env = "LOCAL_WAREHOUSE_DIR")]
    pub local_warehouse_dir: Option<PathBuf>,

    #[arg(long = "snowflake-user", env = "SNOWFLAKE_USERNAME")]
    pub user: Option<String>,

    #[arg(long = "snowflake-password", env = "SNOWFLAKE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long = "snowflake-account", env = "SNOWFLAKE_ACCOUNT")]
    pub account: Option<String>,

    #[arg(long = "snowflake-warehouse", env = "SNOWFLAKE_WAREHOUSE")]
    pub warehouse: Option<String>,

    #[arg(long = "snowflake-database", env = "SNOWFLAKE_DATABASE")]
    pub database: Option<String>,

    #[arg(long = "snowflake-schema", env = "SNOWFLAKE_SCHEMA")]
    pub schema: Option<String>,
}

/// Batch job: fit a fresh model and publish predictions
#[derive(Debug, Parser)]
#[command(name = "train", version)]
pub struct TrainArgs {
    #[command(flatten)]
    pub warehouse: WarehouseArgs,

    #[command(flatten)]
    pub data_lake: DataLakeArgs,
}

/// Serve house price predictions from the published model
#[derive(Debug, Parser)]
#[command(name = "api", version)]
pub struct ApiArgs {
    #[command(flatten)]
    pub data_lake: DataLakeArgs,

    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}

impl ApiArgs {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// `RUST_LOG` wins, otherwise `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
