use crate::coordinator::LockClient;
use crate::error::Error;
use crate::log::LogHook;
use crate::store::DynamoDbLockStore;
use crate::table::TableDescriptor;
use std::sync::Arc;

/// [`LockClient`] builder.
#[derive(Default)]
pub struct LockClientBuilder {
    table: TableDescriptor,
    log_hook: Option<LogHook>,
}

impl LockClientBuilder {
    /// Sets the table descriptor. Default is [`TableDescriptor::default`].
    pub fn table(mut self, table: TableDescriptor) -> Self {
        self.table = table;
        self
    }

    /// Registers a callback invoked with every coordinator log event in addition to
    /// the `tracing` events the coordinator always emits.
    pub fn log_hook(mut self, hook: LogHook) -> Self {
        self.log_hook = Some(hook);
        self
    }

    /// Validates the table descriptor, checks the dynamodb table has the expected
    /// schema, and builds a [`LockClient`].
    ///
    /// # Errors
    /// [`Error::LockTableConfigValidation`] if the descriptor uses a reserved attribute
    /// name or a duplicate partition/sort key; [`Error::Other`] if the table is missing
    /// or its schema does not match the descriptor.
    pub async fn build_and_check_db(self, dynamodb_client: aws_sdk_dynamodb::Client) -> Result<LockClient, Error> {
        self.table.validate()?;
        let table = Arc::new(self.table);
        let store = DynamoDbLockStore::new(dynamodb_client, table.clone());
        store.check_schema().await?;

        Ok(LockClient::new(Arc::new(store), table, self.log_hook))
    }
}
