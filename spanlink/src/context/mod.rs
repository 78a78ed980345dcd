// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The per-execution-context ambient-transaction slot and its propagation
//! capsule.
//!
//! Each thread carries one slot holding the transaction that code running on
//! it is currently attributed to. Crossing onto another thread never inherits
//! the slot implicitly: identity travels as an explicit value, either a
//! [`Token`] linked by hand or a [`ContextCarrier`] activated by the
//! scheduler around the unit of work.

use crate::token::Token;
use crate::transaction::Transaction;
use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static AMBIENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

/// Replaces the slot of the calling context, returning the displaced value.
pub(crate) fn swap(next: Option<Transaction>) -> Option<Transaction> {
    AMBIENT.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), next))
}

/// Resolves the ambient transaction of the calling context.
///
/// An ended transaction left behind in the slot resolves to `None` and is
/// cleared, so work on a reused thread is never attributed to a finished
/// transaction.
pub(crate) fn current() -> Option<Transaction> {
    AMBIENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(transaction) if !transaction.is_ended() => Some(transaction.clone()),
            Some(_) => {
                *slot = None;
                None
            },
            None => None,
        }
    })
}

/// Restores `previous` into the slot, but only while the slot still holds the
/// transaction that displaced it. Used by [`Transaction::end`].
pub(crate) fn restore_if(ending: &Transaction, previous: Option<Transaction>) {
    AMBIENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|held| held.id() == ending.id()) {
            *slot = previous;
        }
    });
}

/// Binds `transaction` to the calling context for the lifetime of the
/// returned scope. Root-transaction futures use this around every poll, the
/// same way carriers do for spawned work.
pub(crate) fn bind(transaction: &Transaction) -> ActiveContext {
    ActiveContext {
        previous: swap(Some(transaction.clone())),
        _not_send: PhantomData,
    }
}

/// Empties the slot of the calling context for the lifetime of the returned
/// scope. Schedulers use this around units of work that carry no context, so
/// a reused thread cannot leak an earlier attribution into them.
pub(crate) fn isolate() -> ActiveContext {
    ActiveContext {
        previous: swap(None),
        _not_send: PhantomData,
    }
}

/// A propagation capsule attached to a scheduled unit of concurrent work.
///
/// The scheduler activates the carrier on the executing context immediately
/// before user code runs, binding the carried transaction there, and the
/// returned [`ActiveContext`] restores whatever was ambient before once the
/// work suspends or completes. This removes the need for every spawned
/// callable to call [`Token::link`] by hand.
#[derive(Debug, Clone)]
pub struct ContextCarrier {
    token: Token,
}

impl ContextCarrier {
    /// Wraps a token for attachment to a unit of work.
    pub fn new(token: Token) -> Self {
        Self { token }
    }

    /// Builds a carrier from the ambient transaction of the calling context,
    /// if any. `None` simply means the spawned work runs untraced.
    pub fn from_current() -> Option<Self> {
        current().map(|transaction| Self::new(transaction.issue_token()))
    }

    /// Binds the carried transaction as the ambient transaction of the
    /// calling context. An expired token binds nothing: the context is left
    /// isolated rather than attributed to an unrelated transaction.
    ///
    /// Dropping the returned scope restores the previously ambient value,
    /// which matters on pooled threads interleaving multiple transactions.
    pub fn activate(&self) -> ActiveContext {
        ActiveContext {
            previous: swap(self.token.transaction_if_live()),
            _not_send: PhantomData,
        }
    }
}

/// Scope over which a [`ContextCarrier`] binding is in effect.
///
/// Restores the displaced ambient value on drop. Must be dropped on the
/// thread that created it, and therefore never held across an `.await`.
#[derive(Debug)]
#[must_use = "dropping the scope immediately deactivates the binding"]
pub struct ActiveContext {
    previous: Option<Transaction>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ActiveContext {
    fn drop(&mut self) {
        swap(self.previous.take());
    }
}
