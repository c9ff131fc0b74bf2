//! TOTP per RFC 6238: HOTP keyed to the time counter. The clock is always
//! injected so the engine can be tested at any instant, and the last
//! accepted time counter is carried by the token so a value from an earlier
//! timestep - including the immediately prior one - is refused even when it
//! still sits inside the drift window.

use std::time::Duration;

use warden_proto::error::OperationError;

use crate::credential::hotp::Hotp;
use crate::credential::{CheckOutcome, OtpAlgo, SecretBuf};

pub const TOTP_DEFAULT_STEP: u64 = 30;

/// https://tools.ietf.org/html/rfc6238 which relies on
/// https://tools.ietf.org/html/rfc4226
#[derive(Debug, Clone)]
pub struct Totp {
    inner: Hotp,
    step: u64,
}

impl Totp {
    pub fn new(secret: SecretBuf, digits: u32, algo: OtpAlgo, step: u64) -> Self {
        Totp {
            inner: Hotp::new(secret, digits, algo),
            step: step.max(1),
        }
    }

    /// The time counter at `ct`.
    pub fn counter_at(&self, ct: Duration) -> u64 {
        ct.as_secs() / self.step
    }

    /// The OTP value for the timestep containing `ct`.
    pub fn generate_at(&self, ct: Duration) -> Result<String, OperationError> {
        self.inner.generate(self.counter_at(ct))
    }

    /// Match the presented value against the drift window around now,
    /// refusing every counter at or below `last_accepted`. On a match the
    /// caller persists the returned counter as the new `last_accepted`.
    pub fn check(
        &self,
        otp: &str,
        ct: Duration,
        drift_window: u64,
        last_accepted: Option<u64>,
    ) -> Result<CheckOutcome, OperationError> {
        let center = self.counter_at(ct);
        match self.inner.check_symmetric(otp, center, drift_window)? {
            CheckOutcome::Match(idx) => {
                if last_accepted.is_some_and(|last| idx <= last) {
                    // Replay of an already consumed timestep.
                    Ok(CheckOutcome::NoMatch)
                } else {
                    Ok(CheckOutcome::Match(idx))
                }
            }
            CheckOutcome::NoMatch => Ok(CheckOutcome::NoMatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Totp, TOTP_DEFAULT_STEP};
    use crate::credential::{CheckOutcome, OtpAlgo, SecretBuf};

    const RFC_SECRET_HEX: &str = "3132333435363738393031323334353637383930";

    fn rfc_totp() -> Totp {
        let secret = SecretBuf::from_hex(RFC_SECRET_HEX).expect("failed to decode");
        Totp::new(secret, 8, OtpAlgo::Sha1, TOTP_DEFAULT_STEP)
    }

    #[test]
    fn test_totp_rfc6238_vectors() {
        // https://tools.ietf.org/html/rfc6238 appendix B, sha1 rows.
        let totp = rfc_totp();
        let expect = [
            (59_u64, "94287082"),
            (1111111109, "07081804"),
            (1111111111, "14050471"),
            (1234567890, "89005924"),
            (2000000000, "69279037"),
        ];
        for (secs, value) in expect {
            assert!(totp.generate_at(Duration::from_secs(secs)).as_deref() == Ok(value));
        }
    }

    #[test]
    fn test_totp_accepts_within_drift() {
        let totp = rfc_totp();
        let ct = Duration::from_secs(1111111109);
        let now = totp.counter_at(ct);

        // The previous timestep's value is accepted when nothing newer has
        // been consumed yet.
        let prior = totp
            .generate_at(ct - Duration::from_secs(TOTP_DEFAULT_STEP))
            .expect("failed to generate");
        assert!(totp.check(&prior, ct, 1, None) == Ok(CheckOutcome::Match(now - 1)));

        // Two steps out is beyond a drift window of one.
        let stale = totp
            .generate_at(ct - Duration::from_secs(2 * TOTP_DEFAULT_STEP))
            .expect("failed to generate");
        assert!(totp.check(&stale, ct, 1, None) == Ok(CheckOutcome::NoMatch));
    }

    #[test]
    fn test_totp_rejects_previous_after_accept() {
        let totp = rfc_totp();
        let ct = Duration::from_secs(1111111109);
        let now = totp.counter_at(ct);

        let current = totp.generate_at(ct).expect("failed to generate");
        let previous = totp
            .generate_at(ct - Duration::from_secs(TOTP_DEFAULT_STEP))
            .expect("failed to generate");

        // Accept the current value, recording its counter.
        assert!(totp.check(&current, ct, 1, None) == Ok(CheckOutcome::Match(now)));

        // Time has not advanced. The prior timestep's value is individually
        // valid-looking but must now fail, as must a replay of the current.
        assert!(totp.check(&previous, ct, 1, Some(now)) == Ok(CheckOutcome::NoMatch));
        assert!(totp.check(&current, ct, 1, Some(now)) == Ok(CheckOutcome::NoMatch));
    }
}
