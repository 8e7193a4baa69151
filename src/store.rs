use crate::lock::{millis_since_epoch, Lock};
use crate::table::{
    TableDescriptor, ADDITIONAL_ATTRIBUTES_FIELD, LAST_UPDATED_TIME_FIELD, LEASE_DURATION_FIELD,
    OWNER_NAME_FIELD, RECORD_VERSION_NUMBER_FIELD,
};
use crate::Error;
use aws_sdk_dynamodb::error::{
    DeleteItemError, DeleteItemErrorKind, GetItemError, PutItemError, PutItemErrorKind,
    UpdateItemError, UpdateItemErrorKind,
};
use aws_sdk_dynamodb::model::AttributeValue;
use aws_sdk_dynamodb::types::SdkError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// The persisted fields of a lock record, as read back from the backend.
///
/// Opaque to callers beyond `additional_attributes`, which is preserved verbatim.
#[derive(Debug, Clone)]
pub struct RecordAttributes {
    pub owner_name: String,
    pub record_version_number: Uuid,
    pub last_updated_time_in_ms: i64,
    pub lease_duration_in_ms: i64,
    pub additional_attributes: Value,
}

impl RecordAttributes {
    /// Whether this record's lease has passed expiration as of `now`.
    pub(crate) fn lease_expiration_time_passed(&self, now: OffsetDateTime) -> bool {
        crate::lock::lease_expired(self.last_updated_time_in_ms, self.lease_duration_in_ms, now)
    }
}

/// Abstract conditional key-value interface the coordinator depends on.
///
/// Five operations: a strongly-consistent read, and four conditional writes (create,
/// renew, steal, delete). A production crate ships one implementation
/// ([`DynamoDbLockStore`]); tests may supply a fake.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Strongly-consistent read on the composite key.
    async fn get_lock(&self, lock_group: &str, lock_id: &str) -> Result<Option<RecordAttributes>, Error>;

    /// Conditional put gated on the item not already existing.
    async fn create_new_lock(&self, lock: &Lock) -> Result<(), Error>;

    /// Conditional update (renewal) gated on version *and* owner still matching.
    async fn update_record_version_and_time(
        &self,
        lock: &Lock,
        new_version: Uuid,
        when: OffsetDateTime,
    ) -> Result<(), Error>;

    /// Conditional update (steal) gated on version matching; owner is deliberately not
    /// part of the predicate.
    async fn update_lock_with_new_content(
        &self,
        existing: &RecordAttributes,
        new_lock: &Lock,
    ) -> Result<(), Error>;

    /// Conditional delete gated on version *and* owner still matching.
    async fn delete_lock(&self, lock: &Lock) -> Result<(), Error>;
}

/// [`LockStore`] implementation backed by Amazon DynamoDB.
#[derive(Debug, Clone)]
pub struct DynamoDbLockStore {
    pub(crate) client: aws_sdk_dynamodb::Client,
    pub(crate) table: Arc<TableDescriptor>,
}

impl DynamoDbLockStore {
    /// Builds a store against `table` using an already-configured dynamodb client.
    /// Exposed so callers needing a direct `LockStore` handle (e.g. to poll a record
    /// outside the acquisition/release path) don't have to go through
    /// [`crate::LockClientBuilder`].
    pub fn new(client: aws_sdk_dynamodb::Client, table: Arc<TableDescriptor>) -> Self {
        Self { client, table }
    }

    fn key(&self, lock_group: &str, lock_id: &str) -> HashMap<String, AttributeValue> {
        let mut key = HashMap::new();
        key.insert(
            self.table.partition_key.clone(),
            AttributeValue::S(lock_id.to_owned()),
        );
        key.insert(
            self.table.sort_key.clone(),
            AttributeValue::S(lock_group.to_owned()),
        );
        key
    }

    fn ttl_attribute(&self, when: OffsetDateTime) -> Option<(String, AttributeValue)> {
        let ttl_key = self.table.ttl_key.as_ref()?;
        let expiry_secs = (millis_since_epoch(when) + self.table.ttl_in_ms as i64 + 500) / 1000;
        Some((ttl_key.clone(), AttributeValue::N(expiry_secs.to_string())))
    }

    #[instrument(skip_all)]
    pub(crate) async fn check_schema(&self) -> Result<(), Error> {
        self.check_schema_inner().await.map_err(Error::from)
    }

    async fn check_schema_inner(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        use aws_sdk_dynamodb::model::KeyType;

        let desc = self
            .client
            .describe_table()
            .table_name(&self.table.table_name)
            .send()
            .await
            .with_context(|| format!("Missing table `{}`?", self.table.table_name))?
            .table
            .context("no table description")?;

        let key_schema = desc.key_schema.unwrap_or_default();
        anyhow::ensure!(
            key_schema.len() == 2,
            "Unexpected number of keys ({}) in key_schema, expected 2 (partition + sort)",
            key_schema.len(),
        );
        let has_hash = key_schema
            .iter()
            .any(|k| k.attribute_name() == Some(&self.table.partition_key) && k.key_type() == Some(&KeyType::Hash));
        anyhow::ensure!(
            has_hash,
            "Missing hash key schema for `{}`",
            self.table.partition_key
        );
        let has_range = key_schema
            .iter()
            .any(|k| k.attribute_name() == Some(&self.table.sort_key) && k.key_type() == Some(&KeyType::Range));
        anyhow::ensure!(
            has_range,
            "Missing range key schema for `{}`",
            self.table.sort_key
        );

        if let Some(ttl_key) = &self.table.ttl_key {
            let ttl_desc = self
                .client
                .describe_time_to_live()
                .table_name(&self.table.table_name)
                .send()
                .await
                .with_context(|| format!("Missing time_to_live for table `{}`?", self.table.table_name))?
                .time_to_live_description
                .context("no time to live description")?;
            anyhow::ensure!(
                ttl_desc.attribute_name() == Some(ttl_key.as_str()),
                "time to live for {} is not set",
                ttl_key,
            );
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl LockStore for DynamoDbLockStore {
    #[instrument(skip_all)]
    async fn get_lock(&self, lock_group: &str, lock_id: &str) -> Result<Option<RecordAttributes>, Error> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table.table_name)
            .set_key(Some(self.key(lock_group, lock_id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err: SdkError<GetItemError>| Error::backend(err))?;

        let Some(item) = output.item else {
            return Ok(None);
        };
        item_to_record(&item).map(Some)
    }

    #[instrument(skip_all)]
    async fn create_new_lock(&self, lock: &Lock) -> Result<(), Error> {
        let mut put = self
            .client
            .put_item()
            .table_name(&self.table.table_name)
            .set_item(Some(self.key(&lock.lock_group, &lock.lock_id)))
            .item(OWNER_NAME_FIELD, AttributeValue::S(lock.owner_name().to_string()))
            .item(
                RECORD_VERSION_NUMBER_FIELD,
                AttributeValue::S(
                    lock.record_version_number()
                        .expect("attempt_locking must be called before create_new_lock")
                        .to_string(),
                ),
            )
            .item(
                LAST_UPDATED_TIME_FIELD,
                AttributeValue::N(
                    lock.last_updated_time_in_ms()
                        .expect("attempt_locking must be called before create_new_lock")
                        .to_string(),
                ),
            )
            .item(
                LEASE_DURATION_FIELD,
                AttributeValue::N(lock.lease_duration_in_ms.to_string()),
            )
            .item(
                ADDITIONAL_ATTRIBUTES_FIELD,
                json_to_attribute_value(&lock.additional_attributes),
            )
            .condition_expression(format!(
                "attribute_not_exists({}) AND attribute_not_exists({})",
                self.table.partition_key, self.table.sort_key
            ));

        if let Some((ttl_key, ttl_value)) = self.ttl_attribute(now()) {
            put = put.item(ttl_key, ttl_value);
        }

        match put.send().await {
            Ok(_) => Ok(()),
            Err(err) if is_put_conditional_check_failed(&err) => Err(Error::ConditionalCheckFailed),
            Err(err) => Err(Error::backend(err)),
        }
    }

    #[instrument(skip_all)]
    async fn update_record_version_and_time(
        &self,
        lock: &Lock,
        new_version: Uuid,
        when: OffsetDateTime,
    ) -> Result<(), Error> {
        let mut update = self
            .client
            .update_item()
            .table_name(&self.table.table_name)
            .set_key(Some(self.key(&lock.lock_group, &lock.lock_id)))
            .update_expression(format!(
                "SET {RECORD_VERSION_NUMBER_FIELD} = :new_version, {LAST_UPDATED_TIME_FIELD} = :now"
            ))
            .condition_expression(format!(
                "attribute_exists({pk}) AND attribute_exists({sk}) AND {RECORD_VERSION_NUMBER_FIELD} = :old_version AND {OWNER_NAME_FIELD} = :owner",
                pk = self.table.partition_key,
                sk = self.table.sort_key,
            ))
            .expression_attribute_values(":new_version", AttributeValue::S(new_version.to_string()))
            .expression_attribute_values(":now", AttributeValue::N(millis_since_epoch(when).to_string()))
            .expression_attribute_values(
                ":old_version",
                AttributeValue::S(
                    lock.record_version_number()
                        .expect("lock must have a record_version_number to renew")
                        .to_string(),
                ),
            )
            .expression_attribute_values(":owner", AttributeValue::S(lock.owner_name().to_string()));

        if let Some((ttl_key, ttl_value)) = self.ttl_attribute(when) {
            update = update
                .update_expression(format!(
                    "SET {RECORD_VERSION_NUMBER_FIELD} = :new_version, {LAST_UPDATED_TIME_FIELD} = :now, {ttl_key} = :ttl"
                ))
                .expression_attribute_values(":ttl", ttl_value);
        }

        match update.send().await {
            Ok(_) => Ok(()),
            Err(err) if is_update_conditional_check_failed(&err) => Err(Error::ConditionalCheckFailed),
            Err(err) => Err(Error::backend(err)),
        }
    }

    #[instrument(skip_all)]
    async fn update_lock_with_new_content(
        &self,
        existing: &RecordAttributes,
        new_lock: &Lock,
    ) -> Result<(), Error> {
        let mut update = self
            .client
            .update_item()
            .table_name(&self.table.table_name)
            .set_key(Some(self.key(&new_lock.lock_group, &new_lock.lock_id)))
            .update_expression(format!(
                "SET {RECORD_VERSION_NUMBER_FIELD} = :new_version, {OWNER_NAME_FIELD} = :owner, \
                 {LAST_UPDATED_TIME_FIELD} = :now, {LEASE_DURATION_FIELD} = :lease, \
                 {ADDITIONAL_ATTRIBUTES_FIELD} = :attrs"
            ))
            .condition_expression(format!(
                "attribute_exists({pk}) AND attribute_exists({sk}) AND {RECORD_VERSION_NUMBER_FIELD} = :existing_version",
                pk = self.table.partition_key,
                sk = self.table.sort_key,
            ))
            .expression_attribute_values(
                ":new_version",
                AttributeValue::S(
                    new_lock
                        .record_version_number()
                        .expect("attempt_locking must be called before stealing")
                        .to_string(),
                ),
            )
            .expression_attribute_values(":owner", AttributeValue::S(new_lock.owner_name().to_string()))
            .expression_attribute_values(
                ":now",
                AttributeValue::N(
                    new_lock
                        .last_updated_time_in_ms()
                        .expect("attempt_locking must be called before stealing")
                        .to_string(),
                ),
            )
            .expression_attribute_values(
                ":lease",
                AttributeValue::N(new_lock.lease_duration_in_ms.to_string()),
            )
            .expression_attribute_values(":attrs", json_to_attribute_value(&new_lock.additional_attributes))
            .expression_attribute_values(
                ":existing_version",
                AttributeValue::S(existing.record_version_number.to_string()),
            );

        if let Some((ttl_key, ttl_value)) = self.ttl_attribute(now()) {
            update = update
                .update_expression(format!(
                    "SET {RECORD_VERSION_NUMBER_FIELD} = :new_version, {OWNER_NAME_FIELD} = :owner, \
                     {LAST_UPDATED_TIME_FIELD} = :now, {LEASE_DURATION_FIELD} = :lease, \
                     {ADDITIONAL_ATTRIBUTES_FIELD} = :attrs, {ttl_key} = :ttl"
                ))
                .expression_attribute_values(":ttl", ttl_value);
        }

        match update.send().await {
            Ok(_) => Ok(()),
            Err(err) if is_update_conditional_check_failed(&err) => Err(Error::ConditionalCheckFailed),
            Err(err) => Err(Error::backend(err)),
        }
    }

    #[instrument(skip_all)]
    async fn delete_lock(&self, lock: &Lock) -> Result<(), Error> {
        let delete = self
            .client
            .delete_item()
            .table_name(&self.table.table_name)
            .set_key(Some(self.key(&lock.lock_group, &lock.lock_id)))
            .condition_expression(format!(
                "attribute_exists({pk}) AND attribute_exists({sk}) AND {RECORD_VERSION_NUMBER_FIELD} = :version AND {OWNER_NAME_FIELD} = :owner",
                pk = self.table.partition_key,
                sk = self.table.sort_key,
            ))
            .expression_attribute_values(
                ":version",
                AttributeValue::S(
                    lock.record_version_number()
                        .expect("an acquired lock always has a record_version_number")
                        .to_string(),
                ),
            )
            .expression_attribute_values(":owner", AttributeValue::S(lock.owner_name().to_string()));

        match delete.send().await {
            Ok(_) => Ok(()),
            Err(err) if is_delete_conditional_check_failed(&err) => Err(Error::ConditionalCheckFailed),
            Err(err) => Err(Error::backend(err)),
        }
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn is_put_conditional_check_failed(err: &SdkError<PutItemError>) -> bool {
    matches!(
        err,
        SdkError::ServiceError {
            err: PutItemError {
                kind: PutItemErrorKind::ConditionalCheckFailedException(..),
                ..
            },
            ..
        }
    )
}

fn is_update_conditional_check_failed(err: &SdkError<UpdateItemError>) -> bool {
    matches!(
        err,
        SdkError::ServiceError {
            err: UpdateItemError {
                kind: UpdateItemErrorKind::ConditionalCheckFailedException(..),
                ..
            },
            ..
        }
    )
}

fn is_delete_conditional_check_failed(err: &SdkError<DeleteItemError>) -> bool {
    matches!(
        err,
        SdkError::ServiceError {
            err: DeleteItemError {
                kind: DeleteItemErrorKind::ConditionalCheckFailedException(..),
                ..
            },
            ..
        }
    )
}

fn item_to_record(item: &HashMap<String, AttributeValue>) -> Result<RecordAttributes, Error> {
    let owner_name = attr_string(item, OWNER_NAME_FIELD)?;
    let record_version_number = Uuid::parse_str(&attr_string(item, RECORD_VERSION_NUMBER_FIELD)?)
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid {RECORD_VERSION_NUMBER_FIELD}: {e}")))?;
    let last_updated_time_in_ms = attr_number(item, LAST_UPDATED_TIME_FIELD)?;
    let lease_duration_in_ms = attr_number(item, LEASE_DURATION_FIELD)?;
    let additional_attributes = item
        .get(ADDITIONAL_ATTRIBUTES_FIELD)
        .map(attribute_value_to_json)
        .unwrap_or(Value::Object(Default::default()));

    Ok(RecordAttributes {
        owner_name,
        record_version_number,
        last_updated_time_in_ms,
        lease_duration_in_ms,
        additional_attributes,
    })
}

fn attr_string(item: &HashMap<String, AttributeValue>, field: &str) -> Result<String, Error> {
    match item.get(field) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(Error::Other(anyhow::anyhow!(
            "missing or malformed `{field}` attribute"
        ))),
    }
}

fn attr_number(item: &HashMap<String, AttributeValue>, field: &str) -> Result<i64, Error> {
    match item.get(field) {
        Some(AttributeValue::N(n)) => n
            .parse::<i64>()
            .map_err(|e| Error::Other(anyhow::anyhow!("malformed `{field}` attribute: {e}"))),
        _ => Err(Error::Other(anyhow::anyhow!(
            "missing or malformed `{field}` attribute"
        ))),
    }
}

fn json_to_attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute_value).collect()),
        Value::Object(map) => {
            let m = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_attribute_value(v)))
                .collect();
            AttributeValue::M(m)
        }
    }
}

fn attribute_value_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => serde_json::Number::from_f64(n.parse().unwrap_or_default())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AttributeValue::L(items) => Value::Array(items.iter().map(attribute_value_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_value_to_json(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}
