pub mod retry;

use aws_sdk_dynamodb::{
    error::{CreateTableError, CreateTableErrorKind},
    model::{
        AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
        TimeToLiveSpecification,
    },
    types::SdkError,
};
use std::time::Duration;

/// Test wait timeout, generally long enough that something has probably gone wrong.
pub const TEST_WAIT: Duration = Duration::from_secs(4);

/// Config for localhost dynamodb.
pub async fn localhost_dynamodb() -> aws_sdk_dynamodb::Client {
    let conf = aws_config::from_env().region("eu-west-1").load().await;
    let conf = aws_sdk_dynamodb::config::Builder::from(&conf)
        .endpoint_resolver(aws_sdk_dynamodb::Endpoint::immutable(
            "http://localhost:8000".parse().unwrap(),
        ))
        .build();
    aws_sdk_dynamodb::Client::from_conf(conf)
}

/// Create a lock table with the default composite key (`lock_id` hash, `lock_group`
/// range) and a `ttl` TTL attribute, if it doesn't already exist.
pub async fn create_lock_table(table_name: &str, client: &aws_sdk_dynamodb::Client) {
    let create_table = client
        .create_table()
        .table_name(table_name)
        .billing_mode(BillingMode::PayPerRequest)
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name("lock_id")
                .attribute_type(ScalarAttributeType::S)
                .build(),
        )
        .attribute_definitions(
            AttributeDefinition::builder()
                .attribute_name("lock_group")
                .attribute_type(ScalarAttributeType::S)
                .build(),
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name("lock_id")
                .key_type(KeyType::Hash)
                .build(),
        )
        .key_schema(
            KeySchemaElement::builder()
                .attribute_name("lock_group")
                .key_type(KeyType::Range)
                .build(),
        )
        .send()
        .await;

    match create_table {
        Ok(_)
        | Err(SdkError::ServiceError {
            err:
                CreateTableError {
                    kind: CreateTableErrorKind::ResourceInUseException(..),
                    ..
                },
            ..
        }) => Ok(()),
        Err(e) => Err(e),
    }
    .expect("dynamodb create_table failed: Did you run scripts/init-test.sh ?");

    let ttl_update = client
        .update_time_to_live()
        .table_name(table_name)
        .time_to_live_specification(
            TimeToLiveSpecification::builder()
                .enabled(true)
                .attribute_name("ttl")
                .build(),
        )
        .send()
        .await;
    match ttl_update {
        Ok(_) => Ok(()),
        Err(SdkError::ServiceError { err, .. })
            if err.code() == Some("ValidationException")
                && err.message() == Some("TimeToLive is already enabled") =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
    .expect("dynamodb ttl_update failed");
}

/// Builds a [`dynamodb_lock::LockClient`] against the given table, with the TTL
/// attribute enabled to match [`create_lock_table`].
pub async fn lock_client(table_name: &str, db_client: aws_sdk_dynamodb::Client) -> dynamodb_lock::LockClient {
    dynamodb_lock::LockClient::builder()
        .table(
            dynamodb_lock::TableDescriptor::default()
                .table_name(table_name)
                .ttl_key("ttl"),
        )
        .build_and_check_db(db_client)
        .await
        .unwrap()
}

/// Builds a raw [`dynamodb_lock::DynamoDbLockStore`] against the given table, bypassing
/// the coordinator. Lets a test poll a record's current attributes directly, e.g. to
/// confirm a steal landed without re-implementing the coordinator's own retry loop.
pub fn raw_store(table_name: &str, db_client: aws_sdk_dynamodb::Client) -> dynamodb_lock::DynamoDbLockStore {
    dynamodb_lock::DynamoDbLockStore::new(
        db_client,
        std::sync::Arc::new(
            dynamodb_lock::TableDescriptor::default()
                .table_name(table_name)
                .ttl_key("ttl"),
        ),
    )
}
