use crate::Error;

/// Reserved attribute names. These carry the persisted lock record's payload and may
/// never be chosen as the partition key, sort key or ttl key.
pub const OWNER_NAME_FIELD: &str = "owner_name";
pub const RECORD_VERSION_NUMBER_FIELD: &str = "record_version_number";
pub const LAST_UPDATED_TIME_FIELD: &str = "last_updated_time_in_ms";
pub const LEASE_DURATION_FIELD: &str = "lease_duration_in_ms";
pub const ADDITIONAL_ATTRIBUTES_FIELD: &str = "additional_attributes";

const RESERVED_FIELDS: [&str; 5] = [
    OWNER_NAME_FIELD,
    RECORD_VERSION_NUMBER_FIELD,
    LAST_UPDATED_TIME_FIELD,
    LEASE_DURATION_FIELD,
    ADDITIONAL_ATTRIBUTES_FIELD,
];

/// Describes the dynamodb table backing a [`crate::LockClient`].
///
/// Immutable once built; carries no connection state of its own.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub(crate) table_name: String,
    pub(crate) partition_key: String,
    pub(crate) sort_key: String,
    pub(crate) ttl_key: Option<String>,
    pub(crate) ttl_in_ms: u64,
}

impl Default for TableDescriptor {
    fn default() -> Self {
        Self {
            table_name: "LockTable".into(),
            partition_key: "lock_id".into(),
            sort_key: "lock_group".into(),
            ttl_key: None,
            ttl_in_ms: 60 * 60 * 1000,
        }
    }
}

impl TableDescriptor {
    /// Sets the dynamodb table name. Default `"LockTable"`.
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Sets the partition key attribute name. Default `"lock_id"`.
    pub fn partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = partition_key.into();
        self
    }

    /// Sets the sort key attribute name. Default `"lock_group"`.
    pub fn sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = sort_key.into();
        self
    }

    /// Enables the dynamodb-native TTL hygiene attribute with the given name. Purely a
    /// cleanup mechanism for orphaned records; the core never relies on it for
    /// correctness.
    pub fn ttl_key(mut self, ttl_key: impl Into<String>) -> Self {
        self.ttl_key = Some(ttl_key.into());
        self
    }

    /// Sets the TTL duration added to "now" when the TTL attribute is enabled. Default
    /// 1 hour.
    pub fn ttl_in_ms(mut self, ttl_in_ms: u64) -> Self {
        self.ttl_in_ms = ttl_in_ms;
        self
    }

    /// Validates that none of `partition_key`/`sort_key`/`ttl_key` collide with a
    /// reserved attribute name.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for candidate in [
            Some(self.partition_key.as_str()),
            Some(self.sort_key.as_str()),
            self.ttl_key.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if RESERVED_FIELDS.contains(&candidate) {
                return Err(Error::lock_table_config(format!(
                    "`{candidate}` is a reserved attribute name and cannot be used as a key"
                )));
            }
        }
        if self.partition_key == self.sort_key {
            return Err(Error::lock_table_config(
                "partition_key and sort_key must be different attributes",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TableDescriptor::default().validate().unwrap();
    }

    #[test]
    fn rejects_reserved_partition_key() {
        let err = TableDescriptor::default()
            .partition_key(RECORD_VERSION_NUMBER_FIELD)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::LockTableConfigValidation(_)));
    }

    #[test]
    fn rejects_reserved_ttl_key() {
        let err = TableDescriptor::default()
            .ttl_key(OWNER_NAME_FIELD)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::LockTableConfigValidation(_)));
    }

    #[test]
    fn rejects_clashing_partition_and_sort_keys() {
        let err = TableDescriptor::default()
            .sort_key("lock_id")
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::LockTableConfigValidation(_)));
    }
}
