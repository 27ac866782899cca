//! Trigger-based table changefeed.
//!
//! A row-level `AFTER INSERT OR UPDATE OR DELETE` trigger on the observed
//! table sends each change as JSON on a notification channel:
//!
//! ```json
//! {"table": "einsatz", "op": "UPDATE", "new": {...}, "old": {...}}
//! ```
//!
//! Rows whose JSON would exceed the notification limit are sent with only
//! their id and organization columns. The trigger can be installed by
//! [`PgChangeFeed::install_trigger`], or on first open when configured.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info, warn};

use pulse_core::defaults::{
    CHANGEFEED_CHANNEL, CHANGEFEED_ID_COLUMN, CHANGEFEED_ORG_COLUMN, CHANGEFEED_TABLE,
    NOTIFY_PAYLOAD_LIMIT,
};
use pulse_core::{ChangeFeed, ChangeStream, ChangeTranslator, ChangefeedBroker, Result, RowChange};

use crate::ident::validate_identifier;
use crate::notify::notification_stream;

/// Changefeed broker over PostgreSQL triggers.
pub type PgChangefeedBroker = ChangefeedBroker<PgChangeFeed>;

/// Row changes of one table, delivered through `LISTEN`.
pub struct PgChangeFeed {
    pool: PgPool,
    channel: String,
    table: String,
    organization_column: String,
    id_column: String,
    install_on_open: bool,
    installed: AtomicBool,
}

impl PgChangeFeed {
    /// Feed for the default `einsatz` table on the `einsatz_changes` channel.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: CHANGEFEED_CHANNEL.to_string(),
            table: CHANGEFEED_TABLE.to_string(),
            organization_column: CHANGEFEED_ORG_COLUMN.to_string(),
            id_column: CHANGEFEED_ID_COLUMN.to_string(),
            install_on_open: false,
            installed: AtomicBool::new(false),
        }
    }

    pub fn table(mut self, table: &str) -> Result<Self> {
        self.table = validate_identifier("changefeed table", table)?.to_string();
        Ok(self)
    }

    pub fn organization_column(mut self, column: &str) -> Result<Self> {
        self.organization_column =
            validate_identifier("organization column", column)?.to_string();
        Ok(self)
    }

    pub fn id_column(mut self, column: &str) -> Result<Self> {
        self.id_column = validate_identifier("id column", column)?.to_string();
        Ok(self)
    }

    pub fn channel(mut self, channel: &str) -> Result<Self> {
        self.channel = validate_identifier("changefeed channel", channel)?.to_string();
        Ok(self)
    }

    /// Install the trigger the first time the feed opens.
    pub fn install_on_open(mut self, install: bool) -> Self {
        self.install_on_open = install;
        self
    }

    /// Translator matching this feed's table and columns.
    pub fn translator(&self) -> ChangeTranslator {
        ChangeTranslator::new(&self.table, &self.organization_column, &self.id_column)
    }

    /// Broker over this feed. Performs no I/O.
    pub fn into_broker(self) -> PgChangefeedBroker {
        let translator = self.translator();
        ChangefeedBroker::new(self, translator)
    }

    fn function_name(&self) -> String {
        format!("pulse_notify_{}_changes", self.table)
    }

    fn trigger_name(&self) -> String {
        format!("pulse_{}_changes", self.table)
    }

    /// DDL creating the notify function and the row trigger.
    pub fn trigger_sql(&self) -> Vec<String> {
        let function = self.function_name();
        let trigger = self.trigger_name();
        let (table, channel) = (&self.table, &self.channel);
        let (id, org) = (&self.id_column, &self.organization_column);

        vec![
            format!(
                r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
DECLARE
    payload text;
BEGIN
    payload := json_build_object(
        'table', TG_TABLE_NAME,
        'op', TG_OP,
        'new', CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE row_to_json(NEW) END,
        'old', CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE row_to_json(OLD) END
    )::text;
    IF octet_length(payload) >= {limit} THEN
        payload := json_build_object(
            'table', TG_TABLE_NAME,
            'op', TG_OP,
            'new', CASE WHEN TG_OP = 'DELETE' THEN NULL
                   ELSE json_build_object('{id}', NEW.{id}, '{org}', NEW.{org}) END,
            'old', CASE WHEN TG_OP = 'INSERT' THEN NULL
                   ELSE json_build_object('{id}', OLD.{id}, '{org}', OLD.{org}) END
        )::text;
    END IF;
    PERFORM pg_notify('{channel}', payload);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql"#,
                limit = NOTIFY_PAYLOAD_LIMIT,
            ),
            format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"),
            format!(
                "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION {function}()"
            ),
        ]
    }

    /// Create or replace the notify trigger on the observed table.
    pub async fn install_trigger(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in self.trigger_sql() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        self.installed.store(true, Ordering::SeqCst);

        info!(
            subsystem = "db",
            component = "changefeed",
            op = "install_trigger",
            db_table = %self.table,
            channel = %self.channel,
            "Changefeed trigger installed"
        );
        Ok(())
    }
}

fn parse_change(payload: &str) -> Option<RowChange> {
    match serde_json::from_str::<RowChange>(payload) {
        Ok(change) => Some(change),
        Err(e) => {
            warn!(
                subsystem = "db",
                component = "changefeed",
                payload_len = payload.len(),
                error = %e,
                "Discarding malformed change notification"
            );
            None
        }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn open(&self) -> Result<ChangeStream> {
        if self.install_on_open && !self.installed.load(Ordering::SeqCst) {
            self.install_trigger().await?;
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        debug!(
            subsystem = "db",
            component = "changefeed",
            op = "listen",
            channel = %self.channel,
            "Listening for row changes"
        );

        let changes = notification_stream(listener)
            .filter_map(|notification| async move { parse_change(notification.payload()) });
        Ok(changes.boxed())
    }
}
