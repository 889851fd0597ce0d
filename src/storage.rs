use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use aws_sdk_s3::primitives::ByteStream;
use tokio::runtime::Runtime;

use crate::config::DataLakeArgs;

/// Key-addressed blob store for the model artifact.
pub trait ArtifactStore {
    /// Writes `bytes` under `key`, replacing whatever was there.
    fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

pub fn open_store(args: &DataLakeArgs) -> anyhow::Result<Box<dyn ArtifactStore>> {
    if let Some(dir) = &args.local_artifact_dir {
        tracing::info!("Using local artifact store at {}", dir.display());
        return Ok(Box::new(LocalStore::new(dir)));
    }

    let bucket = args
        .bucket
        .clone()
        .context("missing data lake bucket DATA_LAKE")?;
    Ok(Box::new(S3Store::connect(bucket)?))
}

/// S3 bucket access for synchronous callers.
///
/// The SDK is async only, so the store owns a current-thread runtime and blocks on it.
/// It must not be used from inside another tokio runtime.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    runtime: Runtime,
}

impl S3Store {
    pub fn connect(bucket: String) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let config = runtime.block_on(aws_config::load_defaults(
            aws_config::BehaviorVersion::latest(),
        ));

        Ok(Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
            runtime,
        })
    }
}

impl ArtifactStore for S3Store {
    fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(bytes))
                    .send(),
            )
            .with_context(|| format!("failed to upload s3://{}/{}", self.bucket, key))?;
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.runtime.block_on(async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .with_context(|| format!("failed to fetch s3://{}/{}", self.bucket, key))?;
            let body = object.body.collect().await?;
            Ok::<_, anyhow::Error>(body.into_bytes().to_vec())
        })
    }
}

/// A directory standing in for the data lake. Keys become relative paths.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl ArtifactStore for LocalStore {
    fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(key);
        fs::read(&path).with_context(|| format!("no artifact at {}", path.display()))
    }
}
