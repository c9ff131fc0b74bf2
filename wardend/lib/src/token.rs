//! Per-token mutable state: the secret, the HOTP counter, failure counting,
//! rollout progress and the free-form tokeninfo map. Tokens are independent
//! of each other; the repository behind [`TokenStore`] only needs to keep
//! single-row save semantics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use openssl::memcmp;

use warden_proto::error::OperationError;
use warden_proto::v1::{RolloutState, TokenType};

use crate::credential::{OtpAlgo, SecretBuf};

/// Classification of a tokeninfo value. `Secret` entries carry material like
/// the push private key counterpart data and are redacted from Debug and
/// from every detail payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoClass {
    Plain,
    Secret,
}

/// The arbitrary key/value store each token carries.
#[derive(Clone, Default)]
pub struct TokenInfo {
    map: BTreeMap<String, (InfoClass, String)>,
}

impl TokenInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true") | Some("True"))
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.map.insert(key.to_string(), (InfoClass::Plain, value));
    }

    pub fn set_secret(&mut self, key: &str, value: String) {
        self.map.insert(key.to_string(), (InfoClass::Secret, value));
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// The entries safe to expose in detail payloads.
    pub fn plain_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map
            .iter()
            .filter(|(_, (class, _))| *class == InfoClass::Plain)
            .map(|(k, (_, v))| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut d = fmt.debug_map();
        for (k, (class, v)) in self.map.iter() {
            match class {
                InfoClass::Plain => d.entry(k, v),
                InfoClass::Secret => d.entry(k, &"_"),
            };
        }
        d.finish()
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub serial: String,
    pub token_type: TokenType,
    secret: SecretBuf,
    pub counter: u64,
    pub digits: u32,
    pub algo: OtpAlgo,
    pin: Option<String>,
    pub fail_count: u32,
    pub max_fail: u32,
    pub active: bool,
    pub rollout_state: RolloutState,
    pub owner: Option<String>,
    pub info: TokenInfo,
}

impl Token {
    /// A new token, enrolled and active. Push tokens are moved back to
    /// `ClientWait` by enrollment step one.
    pub fn new(serial: &str, token_type: TokenType, secret: SecretBuf) -> Self {
        Token {
            serial: serial.to_string(),
            token_type,
            secret,
            counter: 0,
            digits: 6,
            algo: OtpAlgo::Sha1,
            pin: None,
            fail_count: 0,
            max_fail: 10,
            active: true,
            rollout_state: RolloutState::Enrolled,
            owner: None,
            info: TokenInfo::default(),
        }
    }

    pub fn secret(&self) -> &SecretBuf {
        &self.secret
    }

    pub fn set_secret(&mut self, secret: SecretBuf) {
        self.secret = secret;
    }

    pub fn set_pin(&mut self, pin: &str) {
        self.pin = Some(pin.to_string());
    }

    /// Constant-time PIN comparison. A token without a PIN accepts only the
    /// empty string.
    pub fn check_pin(&self, presented: &str) -> bool {
        let stored = self.pin.as_deref().unwrap_or("");
        if stored.len() != presented.len() {
            return false;
        }
        if stored.is_empty() {
            return presented.is_empty();
        }
        memcmp::eq(stored.as_bytes(), presented.as_bytes())
    }

    /// Split a presented `PIN+OTP` value. Some when the PIN prefix matches;
    /// the remainder is the OTP part.
    pub fn split_pin_otp<'a>(&self, presented: &'a str) -> Option<&'a str> {
        let pin_len = self.pin.as_deref().map(str::len).unwrap_or(0);
        if presented.len() < pin_len {
            return None;
        }
        let (pin_part, otp_part) = presented.split_at(pin_len);
        if self.check_pin(pin_part) {
            Some(otp_part)
        } else {
            None
        }
    }

    pub fn inc_fail(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
    }

    pub fn reset_fail(&mut self) {
        self.fail_count = 0;
    }

    /// Too many failures; the token never matches until the counter is
    /// reset administratively.
    pub fn is_locked(&self) -> bool {
        self.fail_count >= self.max_fail
    }

    pub fn enable(&mut self) {
        self.active = true;
    }

    pub fn disable(&mut self) {
        self.active = false;
    }

    /// Able to take part in authentication at all.
    pub fn is_usable(&self) -> bool {
        self.active && !self.is_locked() && self.rollout_state == RolloutState::Enrolled
    }

    /// Advance the HOTP counter. The stored counter never moves backwards,
    /// so an accepted OTP can not be replayed.
    pub fn commit_counter(&mut self, new: u64) {
        if new > self.counter {
            self.counter = new;
        }
    }
}

/// Repository boundary for token rows.
pub trait TokenStore {
    fn get(&self, serial: &str) -> Result<Option<Token>, OperationError>;
    fn save(&self, token: Token) -> Result<(), OperationError>;
    fn delete(&self, serial: &str) -> Result<bool, OperationError>;
    fn list_for_owner(&self, owner: &str) -> Result<Vec<Token>, OperationError>;
}

/// In-memory reference implementation used by tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<BTreeMap<String, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Token>>, OperationError> {
        self.inner
            .lock()
            .map_err(|_| OperationError::QueueDisconnected)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, serial: &str) -> Result<Option<Token>, OperationError> {
        let inner = self.lock()?;
        Ok(inner.get(serial).cloned())
    }

    fn save(&self, token: Token) -> Result<(), OperationError> {
        let mut inner = self.lock()?;
        inner.insert(token.serial.clone(), token);
        Ok(())
    }

    fn delete(&self, serial: &str) -> Result<bool, OperationError> {
        let mut inner = self.lock()?;
        Ok(inner.remove(serial).is_some())
    }

    fn list_for_owner(&self, owner: &str) -> Result<Vec<Token>, OperationError> {
        let inner = self.lock()?;
        Ok(inner
            .values()
            .filter(|t| t.owner.as_deref() == Some(owner))
            .cloned()
            .collect())
    }
}
