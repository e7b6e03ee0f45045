//! Application state for the repository server

use std::sync::Arc;

use sqlx::PgPool;

use crate::archive::{ObjectStore, S3Store};
use crate::core::config::Config;
use crate::store::DocStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL connection pool for the primary database
    pub pool: PgPool,
    /// The document store
    pub store: DocStore,
    /// Object store gateway for the archive bucket
    pub objects: Arc<dyn ObjectStore>,
    /// Key prefix inside the archive bucket
    pub archive_prefix: String,
}

impl AppState {
    /// Create a new AppState
    pub async fn new(config: &Config) -> Result<Self, BoxError> {
        // Connect to PostgreSQL
        let pool = PgPool::connect(&config.primary_db).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        // Initialize the AWS SDK and the archive bucket gateway
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let s3 = aws_sdk_s3::Client::new(&aws_config);
        let objects: Arc<dyn ObjectStore> =
            Arc::new(S3Store::new(s3, config.archive_bucket.as_str()));

        let store = DocStore::new(pool.clone());

        Ok(Self {
            pool,
            store,
            objects,
            archive_prefix: config.archive_prefix.clone(),
        })
    }
}
