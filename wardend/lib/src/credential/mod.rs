//! Stateless credential verification: the HOTP/TOTP math and the
//! indexed-secret position matcher. Nothing in this module performs I/O or
//! touches a clock - callers pass the counter or the current time in.

use std::fmt;

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::prelude::*;
use zeroize::Zeroize;

use warden_proto::error::OperationError;

pub mod hotp;
pub mod indexed;
pub mod totp;

/// The result of matching a presented OTP against a window of expected
/// values. Absence of a match is an ordinary outcome here, not an error -
/// malformed input is the error case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The counter index the presented value matched at.
    Match(u64),
    NoMatch,
}

impl CheckOutcome {
    pub fn matched(&self) -> Option<u64> {
        match self {
            CheckOutcome::Match(idx) => Some(*idx),
            CheckOutcome::NoMatch => None,
        }
    }
}

/// A secret byte buffer that wipes its plaintext on drop, on every path.
/// Debug output is redacted and the buffer is never serialised.
pub struct SecretBuf {
    inner: Vec<u8>,
}

impl SecretBuf {
    pub fn new(inner: Vec<u8>) -> Self {
        SecretBuf { inner }
    }

    pub fn from_hex(hexstr: &str) -> Result<Self, OperationError> {
        hex::decode(hexstr)
            .map(|inner| SecretBuf { inner })
            .map_err(|_| OperationError::Parameter("secret is not valid hex".to_string()))
    }

    /// A fresh random secret of `len` bytes.
    pub fn generate(len: usize) -> Self {
        let mut rng = rand::thread_rng();
        let inner: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        SecretBuf { inner }
    }

    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Clone for SecretBuf {
    fn clone(&self) -> Self {
        SecretBuf {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "SecretBuf(<{} bytes redacted>)", self.inner.len())
    }
}

/// The HMAC hash algorithm of an OTP token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl OtpAlgo {
    pub fn parse(raw: &str) -> Result<Self, OperationError> {
        match raw {
            "sha1" => Ok(OtpAlgo::Sha1),
            "sha256" => Ok(OtpAlgo::Sha256),
            "sha512" => Ok(OtpAlgo::Sha512),
            _ => Err(OperationError::Parameter(format!(
                "unknown otp hash algorithm {raw}"
            ))),
        }
    }

    pub(crate) fn digest(self, key: &[u8], counter: u64) -> Result<Vec<u8>, OperationError> {
        let key = PKey::hmac(key).map_err(|_e| OperationError::Crypto)?;
        let mut signer = match self {
            OtpAlgo::Sha1 => {
                Signer::new(MessageDigest::sha1(), &key).map_err(|_e| OperationError::Crypto)?
            }
            OtpAlgo::Sha256 => {
                Signer::new(MessageDigest::sha256(), &key).map_err(|_e| OperationError::Crypto)?
            }
            OtpAlgo::Sha512 => {
                Signer::new(MessageDigest::sha512(), &key).map_err(|_e| OperationError::Crypto)?
            }
        };
        signer
            .update(&counter.to_be_bytes())
            .map_err(|_e| OperationError::Crypto)?;
        let hmac = signer
            .sign_to_vec()
            .map_err(|_e| OperationError::Crypto)?;

        let expect = match self {
            OtpAlgo::Sha1 => 20,
            OtpAlgo::Sha256 => 32,
            OtpAlgo::Sha512 => 64,
        };
        if hmac.len() != expect {
            return Err(OperationError::Crypto);
        }
        Ok(hmac)
    }
}

#[cfg(test)]
mod tests {
    use super::{OtpAlgo, SecretBuf};

    #[test]
    fn test_secretbuf_debug_is_redacted() {
        let s = SecretBuf::new(vec![0xde, 0xad, 0xbe, 0xef]);
        let d = format!("{s:?}");
        assert!(!d.contains("de"));
        assert!(d.contains("4 bytes"));
    }

    #[test]
    fn test_secretbuf_from_hex() {
        let s = SecretBuf::from_hex("3132333435363738393031323334353637383930")
            .expect("failed to decode");
        assert!(s.expose() == b"12345678901234567890");
        assert!(SecretBuf::from_hex("zz").is_err());
    }

    #[test]
    fn test_otpalgo_parse() {
        assert!(OtpAlgo::parse("sha1") == Ok(OtpAlgo::Sha1));
        assert!(OtpAlgo::parse("sha512") == Ok(OtpAlgo::Sha512));
        assert!(OtpAlgo::parse("md5").is_err());
    }

    #[test]
    fn test_otpalgo_digest_lengths() {
        let key = b"12345678901234567890";
        assert!(OtpAlgo::Sha1.digest(key, 0).map(|h| h.len()) == Ok(20));
        assert!(OtpAlgo::Sha256.digest(key, 0).map(|h| h.len()) == Ok(32));
        assert!(OtpAlgo::Sha512.digest(key, 0).map(|h| h.len()) == Ok(64));
    }
}
