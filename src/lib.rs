//! Distributed mutual-exclusion lock client backed by DynamoDB.
//!
//! Multiple independent processes compete to acquire named locks; [`LockClient`]
//! guarantees that at most one holder at a time considers itself the owner of a given
//! `(lock_group, lock_id)`, even under crashes and partial failures, as long as
//! DynamoDB's conditional-write semantics hold.
//!
//! # Example
//! ```
//! # async fn foo() -> anyhow::Result<()> {
//! # let dynamodb_client: aws_sdk_dynamodb::Client = unimplemented!();
//! let client = dynamodb_lock::LockClient::builder()
//!     .table(dynamodb_lock::TableDescriptor::default().table_name("locks"))
//!     .build_and_check_db(dynamodb_client)
//!     .await?;
//!
//! // blocks (retrying) until the lock is acquired, or until max_retry_count is hit
//! let lock = client
//!     .lock("nightly-jobs", "export", dynamodb_lock::LockOptions::default())
//!     .await?;
//!
//! // the lock renews itself in the background until released
//! assert!(lock.is_acquired());
//!
//! client.release_lock(&lock).await?;
//! # Ok(()) }
//! ```

mod builder;
mod coordinator;
mod error;
mod lock;
mod log;
mod options;
mod store;
mod table;

pub use builder::LockClientBuilder;
pub use coordinator::LockClient;
pub use error::Error;
pub use lock::Lock;
pub use log::{LogEvent, LogHook, Severity};
pub use options::LockOptions;
pub use store::{DynamoDbLockStore, LockStore, RecordAttributes};
pub use table::TableDescriptor;
