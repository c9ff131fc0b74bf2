//! Engine configuration and resolved policy values.
//!
//! There are no global config lookups anywhere in the engine. An
//! [`EngineConfig`] is resolved once at orchestration entry and threaded by
//! reference into the verifier and protocol calls. [`PolicyView`] carries the
//! already-resolved policy values for the current request - the engine never
//! evaluates policy matching rules itself.

use std::time::Duration;

use crate::credential::OtpAlgo;

/// Static engine defaults. Production deployments build one of these at
/// startup; tests override individual fields.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// OTP length used when a token does not carry its own.
    pub otp_digits: u32,
    /// Hash algorithm used when a token does not carry its own.
    pub otp_algo: OtpAlgo,
    /// Forward look-ahead window for immediate HOTP checks.
    pub hotp_window: u64,
    /// Attempt the two-step autoresync when an immediate HOTP check misses.
    pub auto_resync: bool,
    /// The much larger window scanned during two-step autoresync.
    pub hotp_sync_window: u64,
    /// How long the first autoresync candidate stays usable.
    pub resync_due: Duration,
    /// TOTP timestep seconds.
    pub totp_step: u64,
    /// Timesteps accepted either side of now for TOTP drift.
    pub totp_drift: u64,
    /// Validity window of a newly created challenge.
    pub challenge_validity: Duration,
    /// Attempts allowed against a single challenge before it stops matching.
    pub challenge_max_attempts: u32,
    /// Key size for the server half of a push enrollment.
    pub push_key_bits: u32,
    /// Time to live advertised in the enrollment URL.
    pub push_ttl_minutes: u32,
    /// The endpoint the smartphone talks to, embedded in enrollment URLs and
    /// signed challenge payloads.
    pub registration_url: String,
    /// Issuer label for enrollment URLs.
    pub issuer: String,
    /// Permitted skew for signed smartphone timestamps, either side of now.
    pub timestamp_tolerance: Duration,
    /// Sleep between challenge store reads while blocking in push-wait.
    pub wait_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            otp_digits: 6,
            otp_algo: OtpAlgo::Sha1,
            hotp_window: 10,
            auto_resync: false,
            hotp_sync_window: 1000,
            resync_due: Duration::from_secs(600),
            totp_step: 30,
            totp_drift: 1,
            challenge_validity: Duration::from_secs(120),
            challenge_max_attempts: 5,
            push_key_bits: 4096,
            push_ttl_minutes: 10,
            registration_url: "https://warden.example.com/ttype/push".to_string(),
            issuer: "Warden".to_string(),
            timestamp_tolerance: Duration::from_secs(600),
            wait_poll_interval: Duration::from_secs(1),
        }
    }
}

/// The alphabet presence confirmation options are drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAlphabet {
    /// A to Z.
    Alpha,
    /// 0 to 9.
    Numeric,
    /// An operator supplied list, resolved from a colon separated policy
    /// value.
    Custom(Vec<String>),
}

impl PresenceAlphabet {
    /// Parse the policy string form: "ALPHA", "NUMERIC", or a colon
    /// separated custom list.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ALPHA" => PresenceAlphabet::Alpha,
            "NUMERIC" => PresenceAlphabet::Numeric,
            custom => PresenceAlphabet::Custom(
                custom
                    .split(':')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        }
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            PresenceAlphabet::Alpha => ('A'..='Z').map(|c| c.to_string()).collect(),
            PresenceAlphabet::Numeric => ('0'..='9').map(|c| c.to_string()).collect(),
            PresenceAlphabet::Custom(v) => v.clone(),
        }
    }
}

/// Policy values resolved by the external policy engine for one request.
#[derive(Debug, Clone)]
pub struct PolicyView {
    /// The user must pick the correct value out of a displayed set when
    /// confirming a push login.
    pub require_presence: bool,
    pub presence_alphabet: PresenceAlphabet,
    /// How many options to display, correct one included.
    pub presence_options: usize,
    /// Smartphones may fetch open challenges without a notification.
    pub allow_polling: bool,
    /// Block the authenticating request until the push resolves, bounded by
    /// this timeout. Mutually exclusive with require_presence.
    pub push_wait: Option<Duration>,
    /// HOTP/TOTP tokens answer with a challenge instead of rejecting when the
    /// user presented only the PIN.
    pub otp_challenge_response: bool,
    /// Number of secret positions requested by an indexed-secret challenge.
    pub indexed_positions: usize,
    /// Question text sent with a push challenge.
    pub push_question: String,
    /// Title text sent with a push challenge.
    pub push_title: String,
}

impl Default for PolicyView {
    fn default() -> Self {
        PolicyView {
            require_presence: false,
            presence_alphabet: PresenceAlphabet::Alpha,
            presence_options: 8,
            allow_polling: true,
            push_wait: None,
            otp_challenge_response: false,
            indexed_positions: 2,
            push_question: "Do you want to confirm the login?".to_string(),
            push_title: "Login request".to_string(),
        }
    }
}
