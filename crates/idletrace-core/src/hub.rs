//! Hub and scope
//!
//! The hub owns the current scope and the reporter. The scope's span slot
//! holds "the active transaction", which idle transactions publish
//! themselves into and remove themselves from.

use crate::error::TraceResult;
use crate::idle::{IdleTransaction, IdleTransactionOptions};
use crate::reporter::{FinishedTransaction, Reporter};
use crate::span::Span;
use crate::transaction::TransactionContext;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutable per-hub context
#[derive(Debug, Default)]
pub struct Scope {
    span: Option<Span>,
    tags: BTreeMap<String, String>,
}

impl Scope {
    /// Span currently set on the scope
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }

    pub fn set_span(&mut self, span: Option<Span>) {
        self.span = span;
    }

    /// The scope's span, if it is a transaction root
    pub fn transaction(&self) -> Option<&Span> {
        self.span.as_ref().filter(|s| s.parent_span_id().is_none())
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

/// Entry point holding the scope and the reporter
pub struct Hub {
    scope: RwLock<Scope>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Hub {
    pub fn new(reporter: Option<Arc<dyn Reporter>>) -> Self {
        Self {
            scope: RwLock::new(Scope::default()),
            reporter,
        }
    }

    pub fn with_reporter(reporter: Arc<dyn Reporter>) -> Self {
        Self::new(Some(reporter))
    }

    /// Mutate the scope
    pub fn configure_scope<R>(&self, f: impl FnOnce(&mut Scope) -> R) -> R {
        f(&mut self.scope.write())
    }

    /// Read the scope
    pub fn with_scope<R>(&self, f: impl FnOnce(&Scope) -> R) -> R {
        f(&self.scope.read())
    }

    /// Active transaction on the scope
    pub fn scope_transaction(&self) -> Option<Span> {
        self.scope.read().transaction().cloned()
    }

    /// Clear the active transaction, whatever it is
    pub fn clear_active_transaction(&self) {
        let mut scope = self.scope.write();
        if let Some(current) = scope.transaction() {
            debug!("Detaching transaction {} from scope", current.span_id());
            scope.set_span(None);
        }
    }

    /// Clear the active transaction only if it is `span`
    pub fn clear_transaction_if(&self, span: &Span) -> bool {
        let mut scope = self.scope.write();
        match scope.transaction() {
            Some(current) if current.ptr_eq(span) => {
                scope.set_span(None);
                true
            }
            _ => false,
        }
    }

    /// Hand a finished transaction to the reporter, returning its event id
    ///
    /// Scope tags are merged in; the transaction's own tags win.
    pub fn capture_transaction(&self, mut transaction: FinishedTransaction) -> Option<String> {
        let Some(reporter) = &self.reporter else {
            debug!(
                "No reporter configured, dropping transaction {}",
                transaction.name
            );
            return None;
        };

        {
            let scope = self.scope.read();
            for (key, value) in scope.tags() {
                transaction
                    .tags
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        if let Err(e) = reporter.report(&transaction) {
            warn!(
                "Reporter {} failed for transaction {}: {}",
                reporter.name(),
                transaction.name,
                e
            );
        }
        Some(transaction.event_id)
    }

    /// Start an idle transaction bound to this hub, with its span recorder
    /// initialised
    pub fn start_idle_transaction(
        self: &Arc<Self>,
        context: TransactionContext,
        options: IdleTransactionOptions,
    ) -> TraceResult<IdleTransaction> {
        let max_spans = options.max_spans;
        let transaction = IdleTransaction::new(context, Some(self.clone()), options)?;
        transaction.init_span_recorder(max_spans);
        Ok(transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemoryReporter;
    use crate::transaction::Transaction;

    #[test]
    fn test_scope_transaction_only_returns_roots() {
        let hub = Hub::default();
        let tx = Transaction::new(TransactionContext::new("root", "test"), None);
        let child = tx.start_child("child");

        hub.configure_scope(|scope| scope.set_span(Some(child.clone())));
        assert!(hub.scope_transaction().is_none());
        assert!(hub.with_scope(|scope| scope.span().is_some()));

        hub.configure_scope(|scope| scope.set_span(Some(tx.root().clone())));
        assert_eq!(hub.scope_transaction().unwrap().span_id(), tx.id());
    }

    #[test]
    fn test_clear_transaction_if_compares() {
        let hub = Hub::default();
        let first = Transaction::new(TransactionContext::new("first", "test"), None);
        let second = Transaction::new(TransactionContext::new("second", "test"), None);

        hub.configure_scope(|scope| scope.set_span(Some(second.root().clone())));
        assert!(!hub.clear_transaction_if(first.root()));
        assert!(hub.scope_transaction().is_some());

        assert!(hub.clear_transaction_if(second.root()));
        assert!(hub.scope_transaction().is_none());
    }

    #[test]
    fn test_clear_active_transaction() {
        let hub = Hub::default();
        let tx = Transaction::new(TransactionContext::new("tx", "test"), None);
        hub.configure_scope(|scope| scope.set_span(Some(tx.root().clone())));

        hub.clear_active_transaction();
        assert!(hub.scope_transaction().is_none());
    }

    #[test]
    fn test_capture_without_reporter() {
        let hub = Hub::default();
        let tx = Transaction::new(TransactionContext::new("tx", "test"), None);
        tx.init_span_recorder(None);
        let event = tx.to_finished(tx.start_timestamp());
        assert!(hub.capture_transaction(event).is_none());
    }

    #[test]
    fn test_capture_with_reporter() {
        let reporter = Arc::new(MemoryReporter::new());
        let hub = Hub::with_reporter(reporter.clone());
        let tx = Transaction::new(TransactionContext::new("tx", "test"), None);
        let event = tx.to_finished(tx.start_timestamp());
        let event_id = event.event_id.clone();

        assert_eq!(hub.capture_transaction(event), Some(event_id));
        assert_eq!(reporter.len(), 1);
    }

    #[test]
    fn test_capture_merges_scope_tags() {
        let reporter = Arc::new(MemoryReporter::new());
        let hub = Hub::with_reporter(reporter.clone());
        hub.configure_scope(|scope| {
            scope.set_tag("release", "1.2.3");
            scope.set_tag("env", "scope");
        });

        let tx = Transaction::new(TransactionContext::new("tx", "test"), None);
        tx.set_tag("env", "transaction");
        hub.capture_transaction(tx.to_finished(tx.start_timestamp()));

        let event = reporter.last().unwrap();
        assert_eq!(event.tags.get("release").map(String::as_str), Some("1.2.3"));
        assert_eq!(event.tags.get("env").map(String::as_str), Some("transaction"));
    }

    #[test]
    fn test_scope_tags() {
        let hub = Hub::default();
        hub.configure_scope(|scope| scope.set_tag("release", "1.2.3"));
        let release = hub.with_scope(|scope| scope.tags().get("release").cloned());
        assert_eq!(release.as_deref(), Some("1.2.3"));
    }
}
