//! The challenge store. A challenge is one open question a token asked
//! during an authentication attempt, keyed by (serial, transaction id). One
//! transaction id groups the challenges of every token that participated in
//! the same attempt, so a follow-up call can poll any of them.
//!
//! The store is a repository boundary: the persistent implementation lives
//! outside the engine. The trait requires row-level read-modify-write
//! atomicity because two peers race on the same row - the smartphone
//! resolving a challenge and a duplicate confirmation bumping the attempt
//! counter.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use warden_proto::error::OperationError;
use warden_proto::v1::ChallengeStatus;

/// A fresh correlator for one authentication attempt.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub serial: String,
    pub transaction_id: String,
    /// Opaque type-specific payload: requested positions for an
    /// indexed-secret challenge, the nonce (with the presence option tail)
    /// for push.
    pub data: String,
    /// The text shown to the authenticating user and sent to the phone.
    pub message: String,
    /// Free-form marker used by multi-round challenges.
    pub session: Option<String>,
    pub created: Duration,
    pub validity: Duration,
    /// Number of response attempts seen, for rate limiting.
    pub received_count: u32,
    pub status: ChallengeStatus,
}

impl Challenge {
    pub fn new(
        serial: &str,
        transaction_id: &str,
        data: String,
        message: String,
        ct: Duration,
        validity: Duration,
    ) -> Self {
        Challenge {
            serial: serial.to_string(),
            transaction_id: transaction_id.to_string(),
            data,
            message,
            session: None,
            created: ct,
            validity,
            received_count: 0,
            status: ChallengeStatus::Open,
        }
    }

    /// Still open and inside its validity window.
    pub fn is_valid(&self, ct: Duration) -> bool {
        self.status == ChallengeStatus::Open && ct < self.created + self.validity
    }

    /// The canonical view of this row at `ct`: a row that is still `Open`
    /// but past its validity reads as `Expired` on every path.
    pub fn status_at(&self, ct: Duration) -> ChallengeStatus {
        if self.status == ChallengeStatus::Open && ct >= self.created + self.validity {
            ChallengeStatus::Expired
        } else {
            self.status
        }
    }

    /// Record one response attempt. Success resolves the row; failure leaves
    /// it open for a retry.
    pub fn record_attempt(&mut self, success: bool) {
        self.received_count = self.received_count.saturating_add(1);
        if success {
            self.status = ChallengeStatus::Accepted;
        }
    }
}

/// Repository boundary for challenge rows.
pub trait ChallengeStore {
    fn create(&self, challenge: Challenge) -> Result<(), OperationError>;

    fn get(&self, serial: &str, transaction_id: &str)
        -> Result<Option<Challenge>, OperationError>;

    /// Every challenge of one authentication attempt, across all serials.
    fn list_by_transaction(&self, transaction_id: &str) -> Result<Vec<Challenge>, OperationError>;

    /// Open, unexpired challenges for one serial - the polling read.
    fn list_open_for_serial(
        &self,
        serial: &str,
        ct: Duration,
    ) -> Result<Vec<Challenge>, OperationError>;

    /// Apply `f` to the row under the row lock. Returns false when the row
    /// does not exist. Concurrent updates to the same row must serialise.
    fn update(
        &self,
        serial: &str,
        transaction_id: &str,
        f: &mut dyn FnMut(&mut Challenge),
    ) -> Result<bool, OperationError>;

    /// Delete resolved and expired rows for a serial. Called after every
    /// challenge-response check regardless of outcome.
    fn janitor(&self, serial: &str, ct: Duration) -> Result<usize, OperationError>;
}

/// In-memory reference implementation. Rows live in a single map guarded by
/// a mutex; `update` runs its closure while the map is locked, which gives
/// the row-level atomicity the trait asks for.
#[derive(Debug, Default)]
pub struct MemoryChallengeStore {
    inner: Mutex<BTreeMap<(String, String), Challenge>>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), Challenge>>, OperationError>
    {
        // A poisoned mutex means another thread died mid-update.
        self.inner
            .lock()
            .map_err(|_| OperationError::QueueDisconnected)
    }
}

impl ChallengeStore for MemoryChallengeStore {
    fn create(&self, challenge: Challenge) -> Result<(), OperationError> {
        let mut inner = self.lock()?;
        let key = (challenge.serial.clone(), challenge.transaction_id.clone());
        inner.insert(key, challenge);
        Ok(())
    }

    fn get(
        &self,
        serial: &str,
        transaction_id: &str,
    ) -> Result<Option<Challenge>, OperationError> {
        let inner = self.lock()?;
        Ok(inner
            .get(&(serial.to_string(), transaction_id.to_string()))
            .cloned())
    }

    fn list_by_transaction(&self, transaction_id: &str) -> Result<Vec<Challenge>, OperationError> {
        let inner = self.lock()?;
        Ok(inner
            .values()
            .filter(|c| c.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    fn list_open_for_serial(
        &self,
        serial: &str,
        ct: Duration,
    ) -> Result<Vec<Challenge>, OperationError> {
        let inner = self.lock()?;
        Ok(inner
            .values()
            .filter(|c| c.serial == serial && c.is_valid(ct))
            .cloned()
            .collect())
    }

    fn update(
        &self,
        serial: &str,
        transaction_id: &str,
        f: &mut dyn FnMut(&mut Challenge),
    ) -> Result<bool, OperationError> {
        let mut inner = self.lock()?;
        match inner.get_mut(&(serial.to_string(), transaction_id.to_string())) {
            Some(row) => {
                f(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn janitor(&self, serial: &str, ct: Duration) -> Result<usize, OperationError> {
        let mut inner = self.lock()?;
        let before = inner.len();
        inner.retain(|_, c| c.serial != serial || c.is_valid(ct));
        Ok(before - inner.len())
    }
}
