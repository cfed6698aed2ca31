//! Translating adapter
//!
//! Wraps the alternate backend and rewrites statements written for the
//! local engine before forwarding them. Engine-local directives (pragmas,
//! settings, checkpoints, extension loading) have no meaning remotely and
//! are acknowledged without being sent.

use regex::Regex;
use std::sync::{Arc, OnceLock};
use warden_core::engine::{EngineAdapter, EngineConfig, QueryResult, TableInfo};
use warden_core::error::EngineError;
use warden_core::{ConnectionId, FallbackProvider, OperationId};

/// What happens to one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// Send this text
    Forward(String),
    /// Acknowledge locally
    Skip,
}

struct Rules {
    local_directive: Regex,
    cast: Regex,
    quoted_ident: Regex,
    using_sample: Regex,
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| Rules {
        local_directive: Regex::new(
            r"(?i)^\s*(PRAGMA|SET|RESET|CHECKPOINT|FORCE\s+CHECKPOINT|INSTALL|LOAD|VACUUM)\b",
        )
        .expect("constant pattern"),
        cast: Regex::new(r"([A-Za-z_][\w.]*)::([A-Za-z_]\w*)").expect("constant pattern"),
        quoted_ident: Regex::new(r#""([^"]+)""#).expect("constant pattern"),
        using_sample: Regex::new(r"(?i)USING\s+SAMPLE\s+(\d+(?:\.\d+)?)\s*%").expect("constant pattern"),
    })
}

/// Dialect rewrite for one provider
#[must_use]
pub fn translate(provider: &FallbackProvider, query: &str) -> Translation {
    let r = rules();
    if r.local_directive.is_match(query) {
        return Translation::Skip;
    }
    let out = match provider {
        FallbackProvider::BigQuery => {
            let casted = r.cast.replace_all(query, "CAST($1 AS $2)");
            let ticked = r.quoted_ident.replace_all(&casted, "`$1`");
            r.using_sample
                .replace_all(&ticked, "TABLESAMPLE SYSTEM ($1 PERCENT)")
                .into_owned()
        }
        FallbackProvider::Snowflake => r.using_sample.replace_all(query, "SAMPLE ($1)").into_owned(),
        FallbackProvider::Redshift | FallbackProvider::Postgres => r
            .using_sample
            .replace_all(query, "TABLESAMPLE BERNOULLI ($1)")
            .into_owned(),
        FallbackProvider::None => query.to_string(),
    };
    Translation::Forward(out)
}

/// Adapter routing to the alternate backend through [`translate`]
pub struct TranslatingAdapter {
    inner: Arc<dyn EngineAdapter>,
    provider: FallbackProvider,
}

impl TranslatingAdapter {
    /// Wrap a connected backend
    #[must_use]
    pub fn new(inner: Arc<dyn EngineAdapter>, provider: FallbackProvider) -> Self {
        Self { inner, provider }
    }

    /// Provider being translated for
    #[inline]
    #[must_use]
    pub fn provider(&self) -> &FallbackProvider {
        &self.provider
    }
}

impl std::fmt::Debug for TranslatingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatingAdapter")
            .field("provider", &self.provider)
            .field("inner", &self.inner.name())
            .finish()
    }
}

#[async_trait::async_trait]
impl EngineAdapter for TranslatingAdapter {
    async fn execute(&self, query: &str) -> Result<QueryResult, EngineError> {
        match translate(&self.provider, query) {
            Translation::Skip => {
                tracing::debug!(provider = self.provider.as_str(), query, "local directive skipped");
                Ok(QueryResult::empty())
            }
            Translation::Forward(text) => self.inner.execute(&text).await,
        }
    }

    async fn cancel(&self, operation: &OperationId) -> Result<(), EngineError> {
        self.inner.cancel(operation).await
    }

    async fn force_terminate(&self, operation: &OperationId) -> Result<(), EngineError> {
        self.inner.force_terminate(operation).await
    }

    async fn reset_connection(&self, connection: ConnectionId) -> Result<(), EngineError> {
        self.inner.reset_connection(connection).await
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.close().await
    }

    async fn reinitialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        self.inner.reinitialize(config).await
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, EngineError> {
        self.inner.list_tables().await
    }

    // Remote resources are managed by the provider.
    async fn set_memory_limit(&self, _bytes: u64) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_max_connections(&self, _max: u32) -> Result<(), EngineError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "translating"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_test_utils::FakeEngine;

    #[test]
    fn local_directives_are_skipped() {
        for q in ["PRAGMA threads=4", "SET memory_limit='1GB'", "checkpoint", "FORCE CHECKPOINT"] {
            assert_eq!(translate(&FallbackProvider::Snowflake, q), Translation::Skip, "{q}");
        }
    }

    #[test]
    fn bigquery_rewrites() {
        let out = translate(
            &FallbackProvider::BigQuery,
            r#"SELECT amount::DOUBLE FROM "orders" USING SAMPLE 10%"#,
        );
        assert_eq!(
            out,
            Translation::Forward(
                "SELECT CAST(amount AS DOUBLE) FROM `orders` TABLESAMPLE SYSTEM (10 PERCENT)".into()
            )
        );
    }

    #[test]
    fn postgres_keeps_casts() {
        let out = translate(&FallbackProvider::Postgres, "SELECT a::INT FROM t USING SAMPLE 5%");
        assert_eq!(
            out,
            Translation::Forward("SELECT a::INT FROM t TABLESAMPLE BERNOULLI (5)".into())
        );
    }

    #[tokio::test]
    async fn adapter_forwards_translated_text() {
        let remote = Arc::new(FakeEngine::named("snowflake"));
        let adapter = TranslatingAdapter::new(remote.clone(), FallbackProvider::Snowflake);

        adapter.execute("SET threads TO 1").await.unwrap();
        adapter.execute("SELECT * FROM t USING SAMPLE 1%").await.unwrap();
        adapter.set_memory_limit(10).await.unwrap();

        assert_eq!(remote.queries(), vec!["SELECT * FROM t SAMPLE (1)".to_string()]);
        assert!(remote.calls().is_empty());
    }
}
