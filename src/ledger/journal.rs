//! Journal Engine
//!
//! Turns a set of posting lines into a POSTED journal entry, or a recorded
//! FAILED one. Version conflicts are retried with jittered exponential
//! backoff against fresh account state; business rejections are terminal.

use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::LedgerError;
use super::store::AccountStore;
use super::types::{AccountStatus, EntryStatus, ExpectedVersion, JournalEntry, PostingLine};
use crate::config::LedgerConfig;
use crate::core_types::{AccountId, MinorUnits, ReferenceId};

/// Conflict retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&LedgerConfig> for RetryPolicy {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Equal-jitter backoff: uniformly in `[cap/2, cap]`, where the cap doubles
    /// per attempt up to `max_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let cap = exp.min(self.max_backoff);
        let cap_us = cap.as_micros() as u64;
        if cap_us == 0 {
            return Duration::ZERO;
        }
        let half = cap_us / 2;
        Duration::from_micros(half + rand::thread_rng().gen_range(0..=cap_us - half))
    }
}

/// Result of comparing an account's cached balance with its postings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceCheck {
    pub account_id: AccountId,
    pub cached_balance: MinorUnits,
    pub posting_sum: MinorUnits,
    pub posting_count: usize,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.posting_sum
    }
}

/// Structural validation, done before any storage access
pub fn validate_lines(lines: &[PostingLine]) -> Result<(), LedgerError> {
    if lines.len() < 2 {
        return Err(LedgerError::TooFewPostings(lines.len()));
    }
    if lines.iter().any(|l| l.amount == 0) {
        return Err(LedgerError::ZeroAmountPosting);
    }
    let sum = lines
        .iter()
        .try_fold(0i64, |acc, l| acc.checked_add(l.amount))
        .ok_or(LedgerError::AmountOverflow)?;
    if sum != 0 {
        return Err(LedgerError::UnbalancedEntry { sum });
    }
    Ok(())
}

async fn within<T>(
    deadline: Instant,
    fut: impl std::future::Future<Output = Result<T, LedgerError>>,
) -> Result<T, LedgerError> {
    // timeout_at polls the inner future once even when already expired
    if Instant::now() >= deadline {
        return Err(LedgerError::DeadlineExceeded);
    }
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| LedgerError::DeadlineExceeded)?
}

pub struct JournalEngine {
    store: Arc<dyn AccountStore>,
    policy: RetryPolicy,
}

impl JournalEngine {
    pub fn new(store: Arc<dyn AccountStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Create and apply a balanced journal entry for `reference`.
    ///
    /// Idempotent per reference: if an entry already exists, a POSTED one is
    /// returned as-is and a FAILED one yields `EntryFailed`. A business
    /// rejection is recorded as a FAILED entry before the error is returned.
    pub async fn create_journal_entry(
        &self,
        reference: ReferenceId,
        lines: &[PostingLine],
        deadline: Instant,
    ) -> Result<JournalEntry, LedgerError> {
        validate_lines(lines)?;

        if let Some(existing) =
            within(deadline, self.store.find_entry_by_reference(&reference)).await?
        {
            debug!(reference = %reference, status = %existing.status, "Journal entry already exists");
            return settled_outcome(existing);
        }

        for attempt in 1..=self.policy.max_attempts {
            match self.try_apply(&reference, lines, deadline).await {
                Ok(entry) => {
                    info!(
                        reference = %reference,
                        entry_id = %entry.id,
                        attempt = attempt,
                        "Journal entry posted"
                    );
                    return Ok(entry);
                }
                Err(LedgerError::Conflict(account)) => {
                    if attempt == self.policy.max_attempts {
                        break;
                    }
                    let delay = self.policy.backoff(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(LedgerError::DeadlineExceeded);
                    }
                    debug!(
                        reference = %reference,
                        account_id = %account,
                        attempt = attempt,
                        delay_us = delay.as_micros() as u64,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LedgerError::DuplicateReference(_)) => {
                    return self.resolve_existing(reference, deadline).await;
                }
                Err(e) if e.is_business_rejection() => {
                    return self.record_failure(reference, e, deadline).await;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            reference = %reference,
            attempts = self.policy.max_attempts,
            "Journal entry gave up on version conflicts"
        );
        Err(LedgerError::ConcurrencyExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Read fresh state for every account, check the entry against it and
    /// hand it to the store with the observed versions.
    async fn try_apply(
        &self,
        reference: &ReferenceId,
        lines: &[PostingLine],
        deadline: Instant,
    ) -> Result<JournalEntry, LedgerError> {
        let mut seen = HashSet::new();
        let mut expected = Vec::with_capacity(lines.len());
        let mut currency: Option<String> = None;

        for line in lines {
            if !seen.insert(line.account_id) {
                continue;
            }
            let account = within(deadline, self.store.get_account(line.account_id)).await?;

            match &currency {
                None => currency = Some(account.currency.clone()),
                Some(expected_currency) if *expected_currency != account.currency => {
                    return Err(LedgerError::CurrencyMismatch {
                        account: account.id,
                        expected: expected_currency.clone(),
                        found: account.currency,
                    });
                }
                Some(_) => {}
            }
            if account.status != AccountStatus::Active {
                return Err(LedgerError::AccountNotActive {
                    account: account.id,
                    status: account.status,
                });
            }

            expected.push(ExpectedVersion {
                account_id: account.id,
                version: account.version,
            });
        }

        let entry = JournalEntry::pending(reference.clone(), lines);
        within(deadline, self.store.apply_postings(&entry, &expected)).await
    }

    async fn record_failure(
        &self,
        reference: ReferenceId,
        cause: LedgerError,
        deadline: Instant,
    ) -> Result<JournalEntry, LedgerError> {
        let failed = JournalEntry::failed(reference.clone(), cause.to_string());
        match within(deadline, self.store.record_failed_entry(&failed)).await {
            Ok(()) => {
                info!(reference = %reference, reason = %cause, "Journal entry failed");
                Err(cause)
            }
            Err(LedgerError::DuplicateReference(_)) => {
                self.resolve_existing(reference, deadline).await
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_existing(
        &self,
        reference: ReferenceId,
        deadline: Instant,
    ) -> Result<JournalEntry, LedgerError> {
        match within(deadline, self.store.find_entry_by_reference(&reference)).await? {
            Some(existing) => settled_outcome(existing),
            None => Err(LedgerError::DuplicateReference(reference)),
        }
    }

    /// Close `reference` with a FAILED entry so nothing can post against it
    /// later. Returns whichever entry holds the reference afterwards, which
    /// is a POSTED one if an application got there first.
    pub async fn void_reference(
        &self,
        reference: ReferenceId,
        reason: &str,
        deadline: Instant,
    ) -> Result<JournalEntry, LedgerError> {
        let failed = JournalEntry::failed(reference.clone(), reason);
        match within(deadline, self.store.record_failed_entry(&failed)).await {
            Ok(()) => {
                info!(reference = %reference, reason = %reason, "Journal reference voided");
                Ok(failed)
            }
            Err(LedgerError::DuplicateReference(_)) => {
                within(deadline, self.store.find_entry_by_reference(&reference))
                    .await?
                    .ok_or(LedgerError::DuplicateReference(reference))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn find_entry(
        &self,
        reference: &ReferenceId,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        self.store.find_entry_by_reference(reference).await
    }

    /// Reconcile an account's cached balance against its posting history
    pub async fn verify_account_balance(
        &self,
        account_id: AccountId,
    ) -> Result<BalanceCheck, LedgerError> {
        let (account, postings) = self.store.account_with_postings(account_id).await?;
        let posting_sum = postings
            .iter()
            .try_fold(0i64, |acc, p| acc.checked_add(p.amount))
            .ok_or(LedgerError::AmountOverflow)?;

        let check = BalanceCheck {
            account_id,
            cached_balance: account.cached_balance,
            posting_sum,
            posting_count: postings.len(),
        };
        if !check.is_consistent() {
            tracing::error!(
                account_id = %account_id,
                cached_balance = check.cached_balance,
                posting_sum = check.posting_sum,
                "Cached balance diverges from postings"
            );
        }
        Ok(check)
    }
}

fn settled_outcome(entry: JournalEntry) -> Result<JournalEntry, LedgerError> {
    match entry.status {
        EntryStatus::Posted => Ok(entry),
        EntryStatus::Failed => Err(LedgerError::EntryFailed {
            reference: entry.reference_id,
            reason: entry.failure_reason.unwrap_or_default(),
        }),
        EntryStatus::Pending => Err(LedgerError::DuplicateReference(entry.reference_id)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryAccountStore;
    use crate::ledger::types::{Account, AccountStatus, NewAccount, Posting};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory store whose applies lose every version race while
    /// `contended` is set
    #[derive(Default)]
    pub(crate) struct ContendedStore {
        inner: InMemoryAccountStore,
        pub(crate) contended: AtomicBool,
        pub(crate) applies: AtomicU32,
    }

    #[async_trait]
    impl AccountStore for ContendedStore {
        async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
            self.inner.get_account(id).await
        }

        async fn open_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
            self.inner.open_account(account).await
        }

        async fn set_status(
            &self,
            id: AccountId,
            status: AccountStatus,
        ) -> Result<Account, LedgerError> {
            self.inner.set_status(id, status).await
        }

        async fn apply_postings(
            &self,
            entry: &JournalEntry,
            expected: &[ExpectedVersion],
        ) -> Result<JournalEntry, LedgerError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if self.contended.load(Ordering::SeqCst) {
                return Err(LedgerError::Conflict(entry.postings[0].account_id));
            }
            self.inner.apply_postings(entry, expected).await
        }

        async fn record_failed_entry(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
            self.inner.record_failed_entry(entry).await
        }

        async fn find_entry_by_reference(
            &self,
            reference: &ReferenceId,
        ) -> Result<Option<JournalEntry>, LedgerError> {
            self.inner.find_entry_by_reference(reference).await
        }

        async fn account_with_postings(
            &self,
            id: AccountId,
        ) -> Result<(Account, Vec<Posting>), LedgerError> {
            self.inner.account_with_postings(id).await
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 8,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    struct Fixture {
        engine: JournalEngine,
        mint: Account,
    }

    impl Fixture {
        async fn new() -> Self {
            let store: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
            let mint = store
                .open_account(NewAccount::new(0, "USD").with_overdraft())
                .await
                .unwrap();
            Self {
                engine: JournalEngine::new(store, policy()),
                mint,
            }
        }

        async fn account(&self, owner: u64, balance: i64) -> Account {
            let account = self
                .engine
                .store()
                .open_account(NewAccount::new(owner, "USD"))
                .await
                .unwrap();
            if balance > 0 {
                self.engine
                    .create_journal_entry(
                        ReferenceId::new(format!("fund-{}", account.id)),
                        &[
                            PostingLine::debit(self.mint.id, balance),
                            PostingLine::credit(account.id, balance),
                        ],
                        deadline(),
                    )
                    .await
                    .unwrap();
            }
            account
        }

        async fn balance(&self, id: AccountId) -> i64 {
            self.engine.store().get_account(id).await.unwrap().cached_balance
        }
    }

    #[test]
    fn test_validate_lines() {
        let a = AccountId::new();
        let b = AccountId::new();
        assert_eq!(
            validate_lines(&[PostingLine::credit(a, 10)]),
            Err(LedgerError::TooFewPostings(1))
        );
        assert_eq!(
            validate_lines(&[PostingLine::debit(a, 10), PostingLine::credit(b, 9)]),
            Err(LedgerError::UnbalancedEntry { sum: -1 })
        );
        assert_eq!(
            validate_lines(&[PostingLine::debit(a, 0), PostingLine::credit(b, 0)]),
            Err(LedgerError::ZeroAmountPosting)
        );
        assert_eq!(
            validate_lines(&[
                PostingLine::credit(a, i64::MAX),
                PostingLine::credit(b, i64::MAX)
            ]),
            Err(LedgerError::AmountOverflow)
        );
        assert!(validate_lines(&[PostingLine::debit(a, 10), PostingLine::credit(b, 10)]).is_ok());
    }

    #[test]
    fn test_backoff_bounds() {
        let p = policy();
        for attempt in 1..=10 {
            let d = p.backoff(attempt);
            assert!(d <= p.max_backoff);
        }
        let first = p.backoff(1);
        assert!(first >= Duration::from_micros(500) && first <= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_unbalanced_entry_touches_nothing() {
        let f = Fixture::new().await;
        let a = f.account(1, 1_000).await;
        let b = f.account(2, 0).await;

        let err = f
            .engine
            .create_journal_entry(
                ReferenceId::new("bad"),
                &[PostingLine::debit(a.id, 100), PostingLine::credit(b.id, 90)],
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(err.is_invalid_entry());
        assert_eq!(f.balance(a.id).await, 1_000);
        assert!(f.engine.find_entry(&ReferenceId::new("bad")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insufficient_funds_recorded_as_failed() {
        let f = Fixture::new().await;
        let a = f.account(1, 10_000).await;
        let b = f.account(2, 0).await;
        let reference = ReferenceId::new("too-much");
        let lines = [PostingLine::debit(a.id, 15_000), PostingLine::credit(b.id, 15_000)];

        let err = f
            .engine
            .create_journal_entry(reference.clone(), &lines, deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let stored = f.engine.find_entry(&reference).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Failed);
        assert!(stored.postings.is_empty());

        // Redelivery of the same reference reports the recorded failure
        let again = f
            .engine
            .create_journal_entry(reference, &lines, deadline())
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::EntryFailed { .. }));
        assert_eq!(f.balance(a.id).await, 10_000);
        assert_eq!(f.balance(b.id).await, 0);
    }

    #[tokio::test]
    async fn test_same_reference_posts_once() {
        let f = Fixture::new().await;
        let a = f.account(1, 10_000).await;
        let b = f.account(2, 0).await;
        let lines = [PostingLine::debit(a.id, 3_000), PostingLine::credit(b.id, 3_000)];

        let first = f
            .engine
            .create_journal_entry(ReferenceId::new("once"), &lines, deadline())
            .await
            .unwrap();
        let second = f
            .engine
            .create_journal_entry(ReferenceId::new("once"), &lines, deadline())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.balance(a.id).await, 7_000);
        assert_eq!(f.balance(b.id).await, 3_000);
    }

    #[tokio::test]
    async fn test_currency_mismatch_rejected() {
        let f = Fixture::new().await;
        let a = f.account(1, 1_000).await;
        let eur = f
            .engine
            .store()
            .open_account(NewAccount::new(2, "EUR"))
            .await
            .unwrap();

        let err = f
            .engine
            .create_journal_entry(
                ReferenceId::new("fx"),
                &[PostingLine::debit(a.id, 100), PostingLine::credit(eur.id, 100)],
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
        assert_eq!(f.balance(a.id).await, 1_000);
    }

    #[tokio::test]
    async fn test_frozen_account_rejected() {
        let f = Fixture::new().await;
        let a = f.account(1, 1_000).await;
        let b = f.account(2, 0).await;
        f.engine
            .store()
            .set_status(b.id, AccountStatus::Frozen)
            .await
            .unwrap();

        let err = f
            .engine
            .create_journal_entry(
                ReferenceId::new("frozen"),
                &[PostingLine::debit(a.id, 100), PostingLine::credit(b.id, 100)],
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotActive { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let f = Arc::new(Fixture::new().await);
        let a = f.account(1, 10_000).await;
        let b = f.account(2, 0).await;

        let mut handles = Vec::new();
        for i in 0..2 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.engine
                    .create_journal_entry(
                        ReferenceId::new(format!("c{}", i)),
                        &[PostingLine::debit(a.id, 6_000), PostingLine::credit(b.id, 6_000)],
                        deadline(),
                    )
                    .await
            }));
        }

        let mut ok = 0;
        let mut insufficient = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::InsufficientFunds { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!((ok, insufficient), (1, 1));
        assert_eq!(f.balance(a.id).await, 4_000);
        assert_eq!(f.balance(b.id).await, 6_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_entries_conserve_money() {
        let f = Arc::new(Fixture::new().await);
        let mut accounts = Vec::new();
        for owner in 0..4 {
            accounts.push(f.account(owner, 1_000).await.id);
        }

        let mut handles = Vec::new();
        for i in 0..40usize {
            let f = f.clone();
            let from = accounts[i % 4];
            let to = accounts[(i + 1) % 4];
            handles.push(tokio::spawn(async move {
                f.engine
                    .create_journal_entry(
                        ReferenceId::new(format!("m{}", i)),
                        &[PostingLine::debit(from, 10), PostingLine::credit(to, 10)],
                        Instant::now() + Duration::from_secs(30),
                    )
                    .await
            }));
        }
        for h in handles {
            let result = h.await.unwrap();
            assert!(
                matches!(result, Ok(_) | Err(LedgerError::ConcurrencyExhausted { .. })),
                "unexpected: {:?}",
                result
            );
        }

        let mut total = 0;
        for id in &accounts {
            let check = f.engine.verify_account_balance(*id).await.unwrap();
            assert!(check.is_consistent());
            total += check.cached_balance;
        }
        assert_eq!(total, 4_000);
        let mint = f.engine.verify_account_balance(f.mint.id).await.unwrap();
        assert_eq!(mint.cached_balance + total, 0);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_attempts() {
        let store = Arc::new(ContendedStore::default());
        store.contended.store(true, Ordering::SeqCst);
        let engine = JournalEngine::new(store.clone(), policy());
        let a = store.open_account(NewAccount::new(1, "USD")).await.unwrap();
        let b = store.open_account(NewAccount::new(2, "USD")).await.unwrap();
        let reference = ReferenceId::new("contended");

        let err = engine
            .create_journal_entry(
                reference.clone(),
                &[PostingLine::debit(a.id, 1), PostingLine::credit(b.id, 1)],
                deadline(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::ConcurrencyExhausted {
                attempts: policy().max_attempts
            }
        );
        assert!(err.is_retryable());
        assert_eq!(store.applies.load(Ordering::SeqCst), policy().max_attempts);
        assert!(engine.find_entry(&reference).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_voided_reference_never_posts() {
        let f = Fixture::new().await;
        let a = f.account(1, 1_000).await;
        let b = f.account(2, 0).await;
        let lines = [PostingLine::debit(a.id, 100), PostingLine::credit(b.id, 100)];

        let voided = f
            .engine
            .void_reference(ReferenceId::new("void"), "abandoned", deadline())
            .await
            .unwrap();
        assert_eq!(voided.status, EntryStatus::Failed);

        let err = f
            .engine
            .create_journal_entry(ReferenceId::new("void"), &lines, deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::EntryFailed { .. }));
        assert_eq!(f.balance(a.id).await, 1_000);

        // A posted reference stays posted
        f.engine
            .create_journal_entry(ReferenceId::new("done"), &lines, deadline())
            .await
            .unwrap();
        let existing = f
            .engine
            .void_reference(ReferenceId::new("done"), "abandoned", deadline())
            .await
            .unwrap();
        assert_eq!(existing.status, EntryStatus::Posted);
        assert_eq!(f.balance(a.id).await, 900);
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let f = Fixture::new().await;
        let a = f.account(1, 1_000).await;
        let b = f.account(2, 0).await;

        let err = f
            .engine
            .create_journal_entry(
                ReferenceId::new("late"),
                &[PostingLine::debit(a.id, 1), PostingLine::credit(b.id, 1)],
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::DeadlineExceeded);
        assert_eq!(f.balance(a.id).await, 1_000);
    }
}
