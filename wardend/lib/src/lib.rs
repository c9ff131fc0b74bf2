//! The Warden server engine library. This implements the token authentication
//! protocol core: credential verification, challenge lifecycle, token state,
//! the push confirmation protocol, and the orchestrator that drives them for
//! each inbound authentication attempt.

#![recursion_limit = "256"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;

pub mod auth;
pub mod challenge;
pub mod config;
pub mod credential;
pub mod push;
pub mod token;
pub mod transport;

use std::time::{Duration, SystemTime};

/// The current time as a duration since the unix epoch. All engine calls
/// take an explicit `ct` so that tests can pin the clock; this is the value
/// callers pass at the request boundary.
pub fn duration_from_epoch_now() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
}

/// A prelude of imports that should be imported by all other Warden modules
/// to help make imports cleaner.
pub mod prelude {
    pub use std::time::Duration;

    pub use warden_proto::error::OperationError;
    pub use warden_proto::v1::{
        AuthDetail, ChallengeDetail, ChallengeStatus, CheckRequest, CheckResponse, ClientMode,
        EnrollFinishRequest, EnrollUrlDetail, FbTokenUpdateRequest, PendingChallenge, PollRequest,
        PushConfirmRequest, RolloutState, TokenType,
    };

    pub use tracery::{
        admin_debug, admin_error, admin_info, admin_warn, perf_trace, push_error, push_info,
        push_warn, request_error, request_info, request_trace, request_warn, security_access,
        security_critical, security_debug, security_error, security_info, tagged_event, EventTag,
    };

    pub use crate::config::{EngineConfig, PolicyView, PresenceAlphabet};
    pub use crate::duration_from_epoch_now;
}
