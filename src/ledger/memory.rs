//! In-process account store.
//!
//! Each account sits behind its own mutex; an application locks the touched
//! accounts in id order, so entries over disjoint accounts never contend and
//! overlapping ones cannot deadlock. Postings are appended while the account
//! lock is held, which keeps `account_with_postings` consistent.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::LedgerError;
use super::store::{AccountStore, expected_version, prospective_balance};
use super::types::{
    Account, AccountStatus, EntryStatus, ExpectedVersion, JournalEntry, NewAccount, Posting,
};
use crate::core_types::{AccountId, ReferenceId};

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    entries: DashMap<ReferenceId, JournalEntry>,
    postings: DashMap<AccountId, Vec<Posting>>,
}

fn lock(slot: &Mutex<Account>) -> Result<MutexGuard<'_, Account>, LedgerError> {
    slot.lock()
        .map_err(|_| LedgerError::Storage("account lock poisoned".to_string()))
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: AccountId) -> Result<Arc<Mutex<Account>>, LedgerError> {
        // Clone the Arc so the shard lock is released before the account lock is taken
        self.accounts
            .get(&id)
            .map(|slot| slot.clone())
            .ok_or(LedgerError::AccountNotFound(id))
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let slot = self.slot(id)?;
        let account = lock(&slot)?.clone();
        Ok(account)
    }

    async fn open_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let account: Account = account.into();
        match self.accounts.entry(account.id) {
            Entry::Occupied(_) => Err(LedgerError::Storage(format!(
                "account {} already exists",
                account.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(account.clone())));
                Ok(account)
            }
        }
    }

    async fn set_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let slot = self.slot(id)?;
        let mut account = lock(&slot)?;
        account.status = status;
        account.version += 1;
        Ok(account.clone())
    }

    async fn apply_postings(
        &self,
        entry: &JournalEntry,
        expected: &[ExpectedVersion],
    ) -> Result<JournalEntry, LedgerError> {
        let mut deltas = entry.deltas();
        deltas.sort_by_key(|(id, _)| *id);

        let slots = deltas
            .iter()
            .map(|(id, _)| self.slot(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guards = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(lock(slot)?);
        }

        // Versions first: a stale snapshot is a conflict, not a business failure
        for guard in &guards {
            if guard.version != expected_version(expected, guard.id)? {
                return Err(LedgerError::Conflict(guard.id));
            }
        }

        let mut new_balances = Vec::with_capacity(guards.len());
        for (guard, (_, delta)) in guards.iter().zip(&deltas) {
            new_balances.push(prospective_balance(guard, *delta)?);
        }

        let mut posted = entry.clone();
        posted.status = EntryStatus::Posted;

        match self.entries.entry(entry.reference_id.clone()) {
            Entry::Occupied(_) => {
                return Err(LedgerError::DuplicateReference(entry.reference_id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(posted.clone());
            }
        }

        for (guard, balance) in guards.iter_mut().zip(new_balances) {
            guard.cached_balance = balance;
            guard.version += 1;
        }
        for posting in &posted.postings {
            self.postings
                .entry(posting.account_id)
                .or_default()
                .push(posting.clone());
        }

        Ok(posted)
    }

    async fn record_failed_entry(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
        match self.entries.entry(entry.reference_id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateReference(entry.reference_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(())
            }
        }
    }

    async fn find_entry_by_reference(
        &self,
        reference: &ReferenceId,
    ) -> Result<Option<JournalEntry>, LedgerError> {
        Ok(self.entries.get(reference).map(|e| e.clone()))
    }

    async fn account_with_postings(
        &self,
        id: AccountId,
    ) -> Result<(Account, Vec<Posting>), LedgerError> {
        let slot = self.slot(id)?;
        let account = lock(&slot)?;
        let postings = self
            .postings
            .get(&id)
            .map(|p| p.clone())
            .unwrap_or_default();
        Ok((account.clone(), postings))
    }
}
