//! Credential manager
//!
//! Orchestrates acquisition from the issuing authority and single-use
//! consumption of tokens held in the credential store.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::authority::CredentialAuthority;
use super::credential::{Credential, CredentialInventory, CredentialState};
use super::repository::CredentialRepository;
use crate::engine::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::storage::now_millis;

/// Credential manager
#[derive(Clone)]
pub struct CredentialManager {
    repository: CredentialRepository,
    authority: Arc<dyn CredentialAuthority>,
}

impl CredentialManager {
    pub fn new(repository: CredentialRepository, authority: Arc<dyn CredentialAuthority>) -> Self {
        Self {
            repository,
            authority,
        }
    }

    pub fn repository(&self) -> &CredentialRepository {
        &self.repository
    }

    pub fn authority(&self) -> &Arc<dyn CredentialAuthority> {
        &self.authority
    }

    /// Request `count` tokens and persist them as `unused`
    ///
    /// Nothing is returned unless the whole batch is durably stored.
    pub async fn acquire(&self, count: u32) -> Result<Vec<Credential>> {
        if count == 0 {
            return Err(Error::InvalidInput(
                "credential count must be positive".to_string(),
            ));
        }

        debug!(count, "Requesting credential issuance");
        let tokens = self.authority.request_issuance(count).await?;
        if tokens.is_empty() {
            return Err(Error::IssuanceError(
                "authority returned no tokens".to_string(),
            ));
        }

        let issued_at = now_millis();
        let credentials: Vec<Credential> = tokens
            .into_iter()
            .map(|token| Credential::issued(token, issued_at))
            .collect();

        self.repository.insert_batch(&credentials).await?;

        info!(requested = count, issued = credentials.len(), "Acquired credentials");
        Ok(credentials)
    }

    /// `acquire`, retrying `IssuanceError` on the given schedule
    ///
    /// Quota exhaustion is returned immediately.
    pub async fn acquire_with_retry(
        &self,
        count: u32,
        backoff: &BackoffPolicy,
    ) -> Result<Vec<Credential>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.acquire(count).await {
                Err(Error::IssuanceError(reason)) if backoff.allows_retry(attempt) => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        attempt,
                        wait_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Credential issuance failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Atomically reserve one unused credential
    pub async fn reserve_one(&self) -> Result<Credential> {
        let credential = self
            .repository
            .reserve_one(now_millis())
            .await?
            .ok_or(Error::NoCredentialAvailable)?;

        debug!(credential_id = %credential.id, "Reserved credential");
        Ok(credential)
    }

    /// `reserved -> spent`; a no-op if already spent
    pub async fn mark_spent(&self, id: Uuid) -> Result<()> {
        if self.repository.mark_spent(id, now_millis()).await? {
            debug!(credential_id = %id, "Credential spent");
            return Ok(());
        }

        match self.repository.state_of(id).await? {
            Some(CredentialState::Spent) => Ok(()),
            Some(state) => Err(Error::InvalidCredentialState {
                id,
                state: state.to_string(),
                operation: "mark spent",
            }),
            None => Err(Error::CredentialNotFound(id)),
        }
    }

    /// `reserved -> unused`; a no-op if already unused
    ///
    /// Releasing a spent credential is refused: its token has left the process.
    pub async fn release(&self, id: Uuid) -> Result<()> {
        if self.repository.release(id).await? {
            debug!(credential_id = %id, "Released credential");
            return Ok(());
        }

        match self.repository.state_of(id).await? {
            Some(CredentialState::Unused) => Ok(()),
            Some(state) => Err(Error::InvalidCredentialState {
                id,
                state: state.to_string(),
                operation: "release",
            }),
            None => Err(Error::CredentialNotFound(id)),
        }
    }

    /// Delete unused credentials older than `ttl`
    pub async fn expire_unused(&self, ttl: ChronoDuration) -> Result<u64> {
        let removed = self.repository.delete_unused_before(now_millis() - ttl).await?;
        if removed > 0 {
            info!(removed, "Expired unused credentials");
        }
        Ok(removed)
    }

    /// Return reservations stranded by a crash to the pool
    ///
    /// Reservations younger than `grace` may belong to a submission still in
    /// flight in another process and are left alone.
    pub async fn release_orphaned(&self, grace: ChronoDuration) -> Result<u64> {
        let cutoff = now_millis()
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let released = self.repository.release_orphaned(cutoff).await?;
        if released > 0 {
            warn!(released, "Released orphaned credential reservations");
        }
        Ok(released)
    }

    pub async fn inventory(&self) -> Result<CredentialInventory> {
        self.repository.inventory().await
    }

    pub async fn list(&self, state: Option<CredentialState>) -> Result<Vec<Credential>> {
        self.repository.list(state).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Credential> {
        self.repository
            .get(id)
            .await?
            .ok_or(Error::CredentialNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Commitment;
    use crate::credentials::authority::{AuthorityError, CredentialProof};
    use crate::storage::Database;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Authority that fails a configurable number of times first
    struct ScriptedAuthority {
        failures: AtomicU32,
        quota: bool,
        calls: AtomicU32,
    }

    impl ScriptedAuthority {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                quota: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CredentialAuthority for ScriptedAuthority {
        async fn request_issuance(&self, count: u32) -> std::result::Result<Vec<Vec<u8>>, AuthorityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.quota {
                return Err(AuthorityError::QuotaExceeded);
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AuthorityError::Unavailable("connection reset".into()));
            }
            Ok((0..count).map(|_| Uuid::new_v4().as_bytes().to_vec()).collect())
        }

        fn prove(&self, token: &[u8], _commitment: &Commitment) -> CredentialProof {
            CredentialProof {
                token: token.to_vec(),
                proof: Vec::new(),
            }
        }

        async fn verify(
            &self,
            _proof: &CredentialProof,
            _commitment: &Commitment,
        ) -> std::result::Result<bool, AuthorityError> {
            Ok(true)
        }
    }

    async fn manager_with(authority: ScriptedAuthority) -> (CredentialManager, Arc<ScriptedAuthority>) {
        let db = Database::in_memory().await.expect("database");
        let authority = Arc::new(authority);
        let manager = CredentialManager::new(
            CredentialRepository::new(db.pool().clone()),
            authority.clone(),
        );
        (manager, authority)
    }

    #[tokio::test]
    async fn test_acquire_three_then_reserve_until_empty() {
        let (manager, _) = manager_with(ScriptedAuthority::new(0)).await;
        let acquired = manager.acquire(3).await.unwrap();
        assert_eq!(acquired.len(), 3);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let credential = manager.reserve_one().await.unwrap();
            assert!(seen.insert(credential.id));
        }
        assert!(matches!(
            manager.reserve_one().await,
            Err(Error::NoCredentialAvailable)
        ));
    }

    #[tokio::test]
    async fn test_acquire_zero_is_rejected() {
        let (manager, authority) = manager_with(ScriptedAuthority::new(0)).await;
        assert!(matches!(manager.acquire(0).await, Err(Error::InvalidInput(_))));
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquire_maps_authority_failures() {
        let (manager, _) = manager_with(ScriptedAuthority::new(1)).await;
        assert!(matches!(manager.acquire(1).await, Err(Error::IssuanceError(_))));

        let mut quota = ScriptedAuthority::new(0);
        quota.quota = true;
        let (manager, _) = manager_with(quota).await;
        assert!(matches!(manager.acquire(1).await, Err(Error::IssuanceExhausted)));
        assert_eq!(manager.inventory().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_recovers() {
        let (manager, authority) = manager_with(ScriptedAuthority::new(2)).await;
        let backoff = BackoffPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5));

        let acquired = manager.acquire_with_retry(2, &backoff).await.unwrap();
        assert_eq!(acquired.len(), 2);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_gives_up() {
        let (manager, authority) = manager_with(ScriptedAuthority::new(10)).await;
        let backoff = BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));

        assert!(matches!(
            manager.acquire_with_retry(1, &backoff).await,
            Err(Error::IssuanceError(_))
        ));
        assert_eq!(authority.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mark_spent_is_idempotent_but_rejects_unused() {
        let (manager, _) = manager_with(ScriptedAuthority::new(0)).await;
        let acquired = manager.acquire(2).await.unwrap();

        let reserved = manager.reserve_one().await.unwrap();
        manager.mark_spent(reserved.id).await.unwrap();
        manager.mark_spent(reserved.id).await.unwrap();
        assert_eq!(manager.get(reserved.id).await.unwrap().state, CredentialState::Spent);

        let unused = acquired
            .iter()
            .find(|c| c.id != reserved.id)
            .expect("second credential");
        let err = manager.mark_spent(unused.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentialState { .. }));
        assert_eq!(err.code(), "E004");

        assert!(matches!(
            manager.mark_spent(Uuid::new_v4()).await,
            Err(Error::CredentialNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_release_returns_credential_to_pool() {
        let (manager, _) = manager_with(ScriptedAuthority::new(0)).await;
        manager.acquire(1).await.unwrap();

        let reserved = manager.reserve_one().await.unwrap();
        manager.release(reserved.id).await.unwrap();
        manager.release(reserved.id).await.unwrap();

        let again = manager.reserve_one().await.unwrap();
        assert_eq!(again.id, reserved.id);

        manager.mark_spent(again.id).await.unwrap();
        assert!(matches!(
            manager.release(again.id).await,
            Err(Error::InvalidCredentialState { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_collide() {
        let (manager, _) = manager_with(ScriptedAuthority::new(0)).await;
        manager.acquire(8).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.reserve_one().await }));
        }

        let reserved = Mutex::new(Vec::new());
        let mut empty = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(credential) => reserved.lock().unwrap().push(credential.id),
                Err(Error::NoCredentialAvailable) => empty += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let reserved = reserved.into_inner().unwrap();
        let unique: HashSet<_> = reserved.iter().collect();
        assert_eq!(reserved.len(), 8);
        assert_eq!(unique.len(), 8);
        assert_eq!(empty, 4);
    }
}
