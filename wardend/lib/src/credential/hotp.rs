//! HOTP per RFC 4226, with the windowed counter matching and the two-step
//! autoresync used when a hardware token has drifted far ahead of the
//! server counter.

use std::time::Duration;

use warden_proto::error::OperationError;

use crate::credential::{CheckOutcome, OtpAlgo, SecretBuf};

/// The candidate produced by the first half of an autoresync. Stored in
/// token state with a due time; usable exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncState {
    pub candidate: u64,
    pub due: Duration,
}

impl ResyncState {
    /// Compact tokeninfo encoding, `candidate:due_secs`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.candidate, self.due.as_secs())
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (candidate, due) = raw.split_once(':')?;
        Some(ResyncState {
            candidate: candidate.parse().ok()?,
            due: Duration::from_secs(due.parse().ok()?),
        })
    }
}

/// The outcome of feeding one OTP into the autoresync state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Two consecutive values matched in order. The token counter must be
    /// committed to `new_counter`.
    Accepted { new_counter: u64 },
    /// First value found in the sync window. Nothing is accepted yet; the
    /// state must be stashed and confirmed by the next request.
    Pending(ResyncState),
    /// No usable match. Any stashed state must be cleared.
    Failed,
}

/// https://tools.ietf.org/html/rfc4226
#[derive(Debug, Clone)]
pub struct Hotp {
    secret: SecretBuf,
    digits: u32,
    algo: OtpAlgo,
}

impl Hotp {
    pub fn new(secret: SecretBuf, digits: u32, algo: OtpAlgo) -> Self {
        Hotp {
            secret,
            digits,
            algo,
        }
    }

    fn truncate(&self, counter: u64) -> Result<u32, OperationError> {
        if !(6..=8).contains(&self.digits) {
            return Err(OperationError::Parameter(format!(
                "unsupported otp length {}",
                self.digits
            )));
        }
        let hmac = self.algo.digest(self.secret.expose(), counter)?;
        // Dynamic truncation, https://tools.ietf.org/html/rfc4226#page-7
        let offset = hmac
            .last()
            .map(|v| (v & 0xf) as usize)
            .ok_or(OperationError::Crypto)?;
        let bytes: [u8; 4] = hmac[offset..offset + 4]
            .try_into()
            .map_err(|_| OperationError::Crypto)?;

        let otp = u32::from_be_bytes(bytes);
        Ok((otp & 0x7fff_ffff) % 10_u32.pow(self.digits))
    }

    /// The OTP value at `counter`, left zero padded to the token's length.
    pub fn generate(&self, counter: u64) -> Result<String, OperationError> {
        self.truncate(counter)
            .map(|v| format!("{v:0width$}", width = self.digits as usize))
    }

    /// Scan `counter..counter+window` for the presented value. The lowest
    /// matching index wins. On a match the caller must commit `idx + 1` as
    /// the new token counter so the same or an earlier OTP can never be
    /// replayed.
    pub fn check(&self, otp: &str, counter: u64, window: u64) -> Result<CheckOutcome, OperationError> {
        for idx in counter..counter.saturating_add(window) {
            if self.generate(idx)? == otp {
                return Ok(CheckOutcome::Match(idx));
            }
        }
        Ok(CheckOutcome::NoMatch)
    }

    /// Scan a window centered on `center`, `window` steps either side,
    /// saturating at zero. Used by TOTP drift matching and autoresync.
    pub fn check_symmetric(
        &self,
        otp: &str,
        center: u64,
        window: u64,
    ) -> Result<CheckOutcome, OperationError> {
        let start = center.saturating_sub(window);
        let end = center.saturating_add(window);
        for idx in start..=end {
            if self.generate(idx)? == otp {
                return Ok(CheckOutcome::Match(idx));
            }
        }
        Ok(CheckOutcome::NoMatch)
    }

    /// One step of the two-phase autoresync. A single stray match inside the
    /// huge sync window is never accepted on its own: the first hit is
    /// stashed, and only a follow-up value matching at exactly the next
    /// counter index, before the due time, resynchronises the token.
    pub fn auto_resync(
        &self,
        otp: &str,
        counter: u64,
        prev: Option<&ResyncState>,
        sync_window: u64,
        due_in: Duration,
        ct: Duration,
    ) -> Result<ResyncOutcome, OperationError> {
        let found = match self.check_symmetric(otp, counter, sync_window)? {
            CheckOutcome::Match(idx) => idx,
            CheckOutcome::NoMatch => return Ok(ResyncOutcome::Failed),
        };
        // A match at or below the committed counter is a replay, never a
        // resync candidate.
        if found < counter {
            return Ok(ResyncOutcome::Failed);
        }

        match prev {
            Some(state) if ct <= state.due => {
                if found == state.candidate + 1 {
                    Ok(ResyncOutcome::Accepted {
                        new_counter: found + 1,
                    })
                } else {
                    Ok(ResyncOutcome::Failed)
                }
            }
            // No stash, or the stash ran out its due time: this match
            // becomes the new candidate.
            _ => Ok(ResyncOutcome::Pending(ResyncState {
                candidate: found,
                due: ct + due_in,
            })),
        }
    }
}
