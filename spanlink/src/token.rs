// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Detachable handles carrying a transaction's identity across execution
//! contexts.

use crate::context;
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-shot-per-attach handle that re-establishes its transaction on
/// whatever execution context calls [`link`](Token::link).
///
/// A token is cloned freely and may be linked from many contexts over its
/// lifetime (fan-out); each `link` affects only the calling context. Once
/// [`expire`](Token::expire)d, every later `link` is a silent no-op: a
/// tracing facility must never disrupt the business logic it observes.
#[derive(Debug, Clone)]
pub struct Token {
    transaction: Transaction,
    live: Arc<AtomicBool>,
}

impl Token {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the token still accepts `link` calls.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Binds this token's transaction as the ambient transaction of the
    /// calling execution context.
    ///
    /// Repeatable while live. Linking an expired token changes nothing,
    /// anywhere: the attempt is noted at debug level and the work simply
    /// runs unattributed.
    pub fn link(&self) {
        if !self.is_live() {
            tracing::debug!(transaction = %self.transaction.id(), "ignoring link on expired token");
            return;
        }
        context::swap(Some(self.transaction.clone()));
    }

    /// Declares that no further cross-context work will reference this
    /// transaction through this token. Terminal and idempotent.
    ///
    /// Contexts already linked stay linked; expiry only blocks future links.
    pub fn expire(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// The wrapped transaction, when the token is still live.
    pub(crate) fn transaction_if_live(&self) -> Option<Transaction> {
        self.is_live().then(|| self.transaction.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NoopRecorder;
    use crate::tracer::Tracer;
    use std::sync::Arc;

    #[test]
    fn link_is_repeatable_while_live() {
        let tracer = Tracer::new(Arc::new(NoopRecorder));
        let transaction = tracer.begin("fan-out");
        let token = transaction.issue_token();
        let _cleared = context::swap(None);
        for _ in 0..3 {
            token.link();
            assert_eq!(Transaction::current().map(|t| t.id()), Some(transaction.id()));
        }
        transaction.end();
    }

    #[test]
    fn link_after_expire_is_a_no_op() {
        let tracer = Tracer::new(Arc::new(NoopRecorder));
        let transaction = tracer.begin("expired");
        let token = transaction.issue_token();
        let _cleared = context::swap(None);
        token.expire();
        token.expire();
        token.link();
        assert!(Transaction::current().is_none());
        assert!(!token.is_live());
        transaction.end();
    }

    #[test]
    fn expiry_is_shared_across_clones() {
        let tracer = Tracer::new(Arc::new(NoopRecorder));
        let transaction = tracer.begin("clones");
        let token = transaction.issue_token();
        let clone = token.clone();
        token.expire();
        assert!(!clone.is_live());
        transaction.end();
    }
}
