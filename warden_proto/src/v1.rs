//! Version 1 of the authentication API types.
//!
//! An authentication is potentially a multi-step process. The client first
//! presents a credential for a user or a single serial. If a token can decide
//! immediately we answer with an accept or reject. If one or more tokens need
//! a challenge-response round instead, the response carries a transaction id
//! and one challenge entry per participating token. The client then repeats
//! the call with the transaction id (and the answer, for tokens that take
//! one) until the challenge resolves, expires, or is declined.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The types of token the engine knows how to drive.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Hotp,
    Totp,
    IndexedSecret,
    Push,
    StaticPass,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Hotp => write!(f, "hotp"),
            TokenType::Totp => write!(f, "totp"),
            TokenType::IndexedSecret => write!(f, "indexedsecret"),
            TokenType::Push => write!(f, "push"),
            TokenType::StaticPass => write!(f, "staticpass"),
        }
    }
}

/// Enrollment progress of a token. Most token types are enrolled the moment
/// they are created. Push tokens wait in `ClientWait` between the two
/// enrollment steps until the smartphone completes the handshake.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RolloutState {
    ClientWait,
    Enrolled,
    Broken,
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutState::ClientWait => write!(f, "clientwait"),
            RolloutState::Enrolled => write!(f, "enrolled"),
            RolloutState::Broken => write!(f, "broken"),
        }
    }
}

/// The canonical resolution state of a challenge. Both the synchronous wait
/// path and the polling path report exactly this enum, so a declined
/// challenge is always distinguishable from one that simply has not been
/// answered yet, and from one that ran out its validity window.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Open,
    Accepted,
    Declined,
    Expired,
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeStatus::Open => write!(f, "open"),
            ChallengeStatus::Accepted => write!(f, "accepted"),
            ChallengeStatus::Declined => write!(f, "declined"),
            ChallengeStatus::Expired => write!(f, "expired"),
        }
    }
}

/// How the client is expected to complete a challenge entry.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// The user types an answer into the login form.
    Interactive,
    /// The client re-polls with the transaction id until the challenge
    /// resolves out of band (push confirmation on the smartphone).
    Poll,
}

/// An inbound "check this credential" call. The web layer has already
/// authenticated nothing at this point - the password field is the material
/// under test.
#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct CheckRequest {
    /// A username or an exact token serial.
    pub user_or_serial: String,
    /// PIN, PIN+OTP, OTP or challenge answer, depending on the step.
    pub password: String,
    /// Present on follow-up calls answering an earlier challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Free-form request context (client ip, user agent, ...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for CheckRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("CheckRequest")
            .field("user_or_serial", &self.user_or_serial)
            .field("password", &"_")
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

/// One challenge a single token contributed to an authentication attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
pub struct ChallengeDetail {
    pub serial: String,
    pub transaction_id: String,
    /// The text shown to the user, e.g. which positions of the secret to
    /// enter, or what was sent to the phone.
    pub message: String,
    pub client_mode: ClientMode,
    /// Type-specific presentation hints.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// The detail payload accompanying every check response.
#[derive(Debug, Serialize, Deserialize, Clone, Default, ToSchema)]
pub struct AuthDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multi_challenge: Vec<ChallengeDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_status: Option<ChallengeStatus>,
}

/// The outcome of a check call. `accepted` is the only field an
/// unauthenticated caller may rely on; the detail message is intentionally
/// generic on the failure path.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct CheckResponse {
    pub accepted: bool,
    pub detail: AuthDetail,
}

/// Returned from push enrollment step one for the client device to scan.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
pub struct EnrollUrlDetail {
    pub url: String,
    pub ttl_minutes: u32,
    pub issuer: String,
    pub serial: String,
}

/// Push enrollment step two, sent by the smartphone after scanning the
/// enrollment URL.
#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct EnrollFinishRequest {
    pub serial: String,
    /// The one-time credential binding this call to enrollment step one.
    pub enrollment_credential: String,
    /// The smartphone public key, PEM encoded.
    pub pubkey: String,
    /// The push transport registration token of the device.
    pub fbtoken: String,
}

impl fmt::Debug for EnrollFinishRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("EnrollFinishRequest")
            .field("serial", &self.serial)
            .field("enrollment_credential", &"_")
            .field("fbtoken", &"_")
            .finish()
    }
}

/// The smartphone answering a push challenge, either from the notification
/// or after retrieving it via polling. The same verification rule applies to
/// both delivery paths.
#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct PushConfirmRequest {
    pub serial: String,
    pub nonce: String,
    /// Hex encoded signature over the confirmed payload.
    pub signature: String,
    /// User refused the login. A validly signed decline resolves the
    /// challenge as declined rather than leaving it to expire.
    #[serde(default)]
    pub decline: bool,
    /// Required when the challenge was created with presence confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_answer: Option<String>,
}

impl fmt::Debug for PushConfirmRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PushConfirmRequest")
            .field("serial", &self.serial)
            .field("nonce", &self.nonce)
            .field("signature", &"_")
            .field("decline", &self.decline)
            .finish()
    }
}

/// The smartphone asking for pending challenges when no push notification
/// arrived. Timestamped and signed; the timestamp window is enforced before
/// the signature is even looked at.
#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct PollRequest {
    pub serial: String,
    /// RFC 3339 timestamp of the request.
    pub timestamp: String,
    /// Hex encoded signature over `serial|timestamp`.
    pub signature: String,
}

impl fmt::Debug for PollRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PollRequest")
            .field("serial", &self.serial)
            .field("timestamp", &self.timestamp)
            .field("signature", &"_")
            .finish()
    }
}

/// One open challenge as handed out by the polling endpoint, signed by the
/// server so the app can verify it came from us.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
pub struct PendingChallenge {
    pub nonce: String,
    pub url: String,
    pub serial: String,
    pub question: String,
    pub title: String,
    pub sslverify: String,
    pub signature: String,
}

/// The smartphone rotating its push transport token. Timestamped and signed
/// like the polling call.
#[derive(Serialize, Deserialize, Clone, ToSchema)]
pub struct FbTokenUpdateRequest {
    pub serial: String,
    pub new_fb_token: String,
    pub timestamp: String,
    pub signature: String,
}

impl fmt::Debug for FbTokenUpdateRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("FbTokenUpdateRequest")
            .field("serial", &self.serial)
            .field("timestamp", &self.timestamp)
            .field("signature", &"_")
            .finish()
    }
}
