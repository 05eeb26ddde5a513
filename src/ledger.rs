// ============================================================
// src/ledger.rs — in-memory balance ledger
// ============================================================
// Every user has one balance, lazily created with the configured
// opening balance on first touch. Balances are stored as cents in
// an AtomicI64, so a debit is a plain compare-exchange loop: no
// mutex is held while money moves, and debits against different
// users never contend with each other (DashMap shards the outer map).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::error;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

/// User identifier resolved by the auth layer. The ledger never
/// invents one; it operates on whatever identity it is handed.
pub type AccountId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Amount is not strictly positive, or has finer precision than
    /// whole cents. Rejected before the balance map is touched.
    #[error("payment amount must be positive with at most two decimal places, got {amount}")]
    InvalidAmount { amount: Decimal },
    /// The debit would drive the balance negative. The balance is
    /// left untouched; current and requested are reported for the caller.
    #[error("insufficient balance. Current: {current}, Required: {requested}")]
    InsufficientFunds { current: Decimal, requested: Decimal },
}

impl LedgerError {
    /// Stable machine-readable code carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount { .. } => "invalid_amount",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
        }
    }
}

/// Shared map of user balances.
///
/// Two-decimal currency semantics: amounts are converted to cents at
/// the boundary and rejected if they carry finer precision, so the
/// stored i64 is always an exact representation of the balance.
pub struct Ledger {
    accounts: DashMap<AccountId, Arc<AtomicI64>>,
    opening_balance_cents: i64,
}

impl Ledger {
    /// Fails if the opening balance is negative or not representable
    /// in whole cents; that is a deployment mistake, caught at startup.
    pub fn new(opening_balance: Decimal) -> Result<Self, LedgerError> {
        let cents = to_cents(opening_balance)
            .filter(|&c| c >= 0)
            .ok_or(LedgerError::InvalidAmount {
                amount: opening_balance,
            })?;
        Ok(Self {
            accounts: DashMap::new(),
            opening_balance_cents: cents,
        })
    }

    /// Current balance for the user, seeding the account with the
    /// opening balance if it has never been seen. Never fails.
    pub fn balance(&self, account_id: AccountId) -> Decimal {
        let cents = self.account(account_id).load(Ordering::Acquire);
        from_cents(cents)
    }

    /// Atomically subtract `amount` from the user's balance and return
    /// the new balance.
    ///
    /// Optimistic concurrency: read the balance, compute the new one,
    /// and publish it with a compare-exchange. If another debit landed
    /// in between, re-read and try again. An insufficient balance is a
    /// terminal outcome, not a conflict: it returns immediately and
    /// never retries. The loop terminates because every competing
    /// success strictly lowers the balance, which can only happen a
    /// finite number of times before the insufficient-funds path wins.
    pub fn debit(&self, account_id: AccountId, amount: Decimal) -> Result<Decimal, LedgerError> {
        let debit_cents = match to_cents(amount).filter(|&c| c > 0) {
            Some(c) => c,
            None => return Err(LedgerError::InvalidAmount { amount }),
        };

        let balance = self.account(account_id);
        loop {
            let current = balance.load(Ordering::Acquire);
            let new = current - debit_cents;
            if new < 0 {
                return Err(LedgerError::InsufficientFunds {
                    current: from_cents(current),
                    requested: amount,
                });
            }
            match balance.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    // Post-write audit: concurrent debits may have lowered
                    // the stored balance further, but a negative value means
                    // the ledger itself is broken, never a caller mistake.
                    let settled = balance.load(Ordering::Acquire);
                    if settled < 0 {
                        debug_assert!(false, "negative balance {settled} for user {account_id}");
                        error!(
                            "[payment] ledger invariant violated: user {account_id} at {settled} cents"
                        );
                    }
                    return Ok(from_cents(new));
                }
                // Lost the race against a concurrent debit; re-read.
                Err(_) => continue,
            }
        }
    }

    /// Number of accounts seen so far.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    // Get-or-insert is a single DashMap operation, so N concurrent
    // first-touches of one user produce exactly one seeded entry.
    fn account(&self, account_id: AccountId) -> Arc<AtomicI64> {
        self.accounts
            .entry(account_id)
            .or_insert_with(|| Arc::new(AtomicI64::new(self.opening_balance_cents)))
            .clone()
    }
}

// Checked arithmetic throughout: a wire amount near Decimal's upper
// bound must come back as InvalidAmount, never as a panic.
fn to_cents(amount: Decimal) -> Option<i64> {
    let cents = amount.checked_mul(Decimal::ONE_HUNDRED)?.normalize();
    if cents.scale() != 0 {
        return None;
    }
    cents.to_i64()
}

fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Barrier;
    use std::thread;

    fn ledger(opening: Decimal) -> Ledger {
        Ledger::new(opening).unwrap()
    }

    #[test]
    fn balance_seeds_unseen_account_with_opening_balance() {
        let ledger = ledger(dec!(10000));
        assert_eq!(ledger.balance(1), dec!(10000.00));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn debit_reduces_balance_by_exact_amount() {
        let ledger = ledger(dec!(10000));
        assert_eq!(ledger.debit(1, dec!(100.0)).unwrap(), dec!(9900.00));
        assert_eq!(ledger.balance(1), dec!(9900.00));
    }

    #[test]
    fn overdraft_is_rejected_and_balance_unchanged() {
        let ledger = ledger(dec!(10000));
        ledger.debit(1, dec!(100.0)).unwrap();

        let err = ledger.debit(1, dec!(20000)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                current: dec!(9900.00),
                requested: dec!(20000),
            }
        );
        assert_eq!(ledger.balance(1), dec!(9900.00));
    }

    #[test]
    fn zero_negative_and_sub_cent_amounts_are_invalid() {
        let ledger = ledger(dec!(100));
        for bad in [dec!(0), dec!(-5), dec!(0.001), dec!(19.999)] {
            let err = ledger.debit(1, bad).unwrap_err();
            assert_eq!(err, LedgerError::InvalidAmount { amount: bad });
        }
        // None of the rejections touched the balance.
        assert_eq!(ledger.balance(1), dec!(100.00));
    }

    #[test]
    fn amounts_too_large_to_convert_are_invalid_not_fatal() {
        let ledger = ledger(dec!(100));
        // Decimal::MAX parses off the wire but overflows the cents
        // conversion; it must surface as InvalidAmount, not a panic.
        let err = ledger.debit(1, Decimal::MAX).unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount {
            amount: Decimal::MAX
        });
        assert_eq!(ledger.balance(1), dec!(100.00));

        // Same guard protects the opening balance at construction.
        assert!(Ledger::new(Decimal::MAX).is_err());
    }

    #[test]
    fn two_decimal_amounts_are_accepted() {
        let ledger = ledger(dec!(100));
        assert_eq!(ledger.debit(1, dec!(0.01)).unwrap(), dec!(99.99));
    }

    #[test]
    fn negative_opening_balance_is_rejected_at_construction() {
        assert!(Ledger::new(dec!(-1)).is_err());
        assert!(Ledger::new(dec!(10.005)).is_err());
    }

    #[test]
    fn accounts_are_independent() {
        let ledger = ledger(dec!(50));
        ledger.debit(1, dec!(50)).unwrap();
        // Account 1 is empty, but account 2 still has its full opening balance.
        assert_eq!(ledger.debit(2, dec!(50)).unwrap(), dec!(0.00));
        assert_eq!(ledger.balance(1), dec!(0.00));
    }

    #[test]
    fn concurrent_first_touches_seed_exactly_once() {
        let ledger = Arc::new(ledger(dec!(10000)));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        ledger.balance(42);
                    } else {
                        ledger.debit(42, dec!(1.00)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // One seed event, and exactly the 8 successful debits applied to it.
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.balance(42), dec!(9992.00));
    }

    #[test]
    fn contended_debits_never_overdraw() {
        // Balance 100, two concurrent debits of 60: exactly one succeeds.
        let ledger = Arc::new(ledger(dec!(100)));
        ledger.balance(7);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.debit(7, dec!(60))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(matches!(
            results.iter().find(|r| r.is_err()),
            Some(Err(LedgerError::InsufficientFunds { .. }))
        ));
        assert_eq!(ledger.balance(7), dec!(40.00));
    }

    #[test]
    fn no_debit_is_lost_or_double_applied_under_contention() {
        let ledger = Arc::new(ledger(dec!(500)));
        let threads = 8;
        let per_thread = 100;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut successes = 0u32;
                    for _ in 0..per_thread {
                        if ledger.debit(9, dec!(1.00)).is_ok() {
                            successes += 1;
                        }
                    }
                    successes
                })
            })
            .collect();
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // 800 attempts against 500: conservation means the final balance is
        // exactly opening minus the successes, and it never went negative.
        assert_eq!(total, 500);
        assert_eq!(ledger.balance(9), dec!(0.00));
    }

    #[test]
    fn contended_debits_on_different_accounts_both_succeed() {
        let ledger = Arc::new(ledger(dec!(60)));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [1i64, 2]
            .into_iter()
            .map(|account| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.debit(account, dec!(60))
                })
            })
            .collect();
        for h in handles {
            // Each account has exactly enough for its own debit.
            assert_eq!(h.join().unwrap().unwrap(), dec!(0.00));
        }
    }
}
