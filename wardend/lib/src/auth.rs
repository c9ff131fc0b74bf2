//! The authentication orchestrator. Given a user or serial and a presented
//! credential, this selects the candidate tokens, drives each token's state
//! machine - immediate check or challenge creation - and aggregates the
//! result into a single accept, reject, challenge or declined verdict.
//!
//! Each token type is a variant of a closed dispatch with a small capability
//! set; types that do not support a capability fall back to a safe default
//! ("no match", "no challenge support") rather than erroring. Per-token
//! failures are caught at this boundary and demoted to a non-match so one
//! broken token can never veto the others.

use tokio::sync::mpsc::UnboundedSender as Sender;

use crate::challenge::{new_transaction_id, Challenge, ChallengeStore};
use crate::credential::hotp::{Hotp, ResyncOutcome, ResyncState};
use crate::credential::indexed;
use crate::credential::totp::Totp;
use crate::credential::CheckOutcome;
use crate::prelude::*;
use crate::push;
use crate::token::{Token, TokenStore};
use crate::transport::PushTransport;

pub const BAD_OTP_MSG: &str = "wrong otp value";
pub const ACCEPT_MSG: &str = "matching 1 tokens";
pub const CHALLENGE_MSG: &str = "please respond to the challenge";
pub const DECLINED_MSG: &str = "challenge was declined";

/// Tokeninfo keys the orchestrator owns.
const INFO_RESYNC_STATE: &str = "otp_resync_state";
const INFO_TOTP_LAST_COUNTER: &str = "totp_last_accepted";

/// Where one authentication attempt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Accept {
        serial: String,
    },
    Reject {
        challenge_status: Option<ChallengeStatus>,
    },
    Challenge {
        transaction_id: String,
        multi_challenge: Vec<ChallengeDetail>,
    },
    Declined,
}

impl AuthVerdict {
    pub fn into_response(self) -> CheckResponse {
        match self {
            AuthVerdict::Accept { serial } => CheckResponse {
                accepted: true,
                detail: AuthDetail {
                    message: ACCEPT_MSG.to_string(),
                    serial: Some(serial),
                    ..AuthDetail::default()
                },
            },
            AuthVerdict::Reject { challenge_status } => CheckResponse {
                accepted: false,
                detail: AuthDetail {
                    message: BAD_OTP_MSG.to_string(),
                    challenge_status,
                    ..AuthDetail::default()
                },
            },
            AuthVerdict::Challenge {
                transaction_id,
                multi_challenge,
            } => CheckResponse {
                accepted: false,
                detail: AuthDetail {
                    message: CHALLENGE_MSG.to_string(),
                    transaction_id: Some(transaction_id),
                    multi_challenge,
                    challenge_status: Some(ChallengeStatus::Open),
                    ..AuthDetail::default()
                },
            },
            AuthVerdict::Declined => CheckResponse {
                accepted: false,
                detail: AuthDetail {
                    message: DECLINED_MSG.to_string(),
                    challenge_status: Some(ChallengeStatus::Declined),
                    ..AuthDetail::default()
                },
            },
        }
    }
}

/// Audit trail of authentication outcomes. Delivery is asynchronous and best
/// effort - a full or closed queue never blocks the authentication itself.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    AuthenticationGranted {
        who: String,
        serial: String,
        ct: Duration,
    },
    AuthenticationDenied {
        who: String,
        reason: &'static str,
        ct: Duration,
    },
    ChallengeIssued {
        who: String,
        transaction_id: String,
        serials: Vec<String>,
        ct: Duration,
    },
}

/// The closed set of token behaviours. Dispatch happens here instead of in
/// a deep inheritance chain; a variant only implements the capabilities its
/// type needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Hotp,
    Totp,
    IndexedSecret,
    Push,
    StaticPass,
}

impl TokenClass {
    fn of(token: &Token) -> Self {
        match token.token_type {
            TokenType::Hotp => TokenClass::Hotp,
            TokenType::Totp => TokenClass::Totp,
            TokenType::IndexedSecret => TokenClass::IndexedSecret,
            TokenType::Push => TokenClass::Push,
            TokenType::StaticPass => TokenClass::StaticPass,
        }
    }

    /// Challenge-response is the only way to drive these types.
    fn challenge_only(self) -> bool {
        matches!(self, TokenClass::Push | TokenClass::IndexedSecret)
    }

    fn supports_challenge(self, policy: &PolicyView) -> bool {
        match self {
            TokenClass::Push | TokenClass::IndexedSecret => true,
            TokenClass::Hotp | TokenClass::Totp => policy.otp_challenge_response,
            TokenClass::StaticPass => false,
        }
    }
}

pub struct Orchestrator<'a> {
    pub tokens: &'a dyn TokenStore,
    pub challenges: &'a dyn ChallengeStore,
    pub transport: &'a dyn PushTransport,
    pub config: &'a EngineConfig,
    pub audit_tx: &'a Sender<AuditEvent>,
}

impl Orchestrator<'_> {
    /// Resolve policy combinations that can not be honored together.
    /// Blocking push-wait can not relay a presence answer back to the
    /// waiting call, so require-presence loses.
    pub(crate) fn resolve_policy(policy: &PolicyView) -> PolicyView {
        let mut policy = policy.clone();
        if policy.push_wait.is_some() && policy.require_presence {
            push_warn!("require_presence is disabled while push_wait is configured");
            policy.require_presence = false;
        }
        policy
    }

    fn audit(&self, event: AuditEvent) {
        if self.audit_tx.send(event).is_err() {
            admin_warn!("unable to queue audit event, continuing ... ");
        }
    }

    /// The enrollment detail a freshly created token hands to the client.
    /// Only token types with a multi-step rollout produce one.
    pub fn init_detail(
        &self,
        token: &mut Token,
        ct: Duration,
    ) -> Result<Option<EnrollUrlDetail>, OperationError> {
        match TokenClass::of(token) {
            TokenClass::Push => push::enroll_start(token, self.config, ct).map(Some),
            _ => Ok(None),
        }
    }

    /// Process one inbound check call.
    pub fn check_credential(
        &self,
        req: &CheckRequest,
        policy: &PolicyView,
        ct: Duration,
    ) -> Result<CheckResponse, OperationError> {
        trace!(?req, "received check request");
        if req.user_or_serial.is_empty() {
            return Err(OperationError::Parameter(
                "user or serial must be present".to_string(),
            ));
        }
        let policy = Self::resolve_policy(policy);

        let mut candidates = match self.tokens.get(&req.user_or_serial)? {
            Some(token) => vec![token],
            None => self.tokens.list_for_owner(&req.user_or_serial)?,
        };
        if candidates.is_empty() {
            // Indistinguishable from a wrong credential on purpose.
            security_info!(who = %req.user_or_serial, "no tokens for authentication attempt");
            self.audit(AuditEvent::AuthenticationDenied {
                who: req.user_or_serial.clone(),
                reason: "no tokens",
                ct,
            });
            return Ok(AuthVerdict::Reject {
                challenge_status: None,
            }
            .into_response());
        }

        let verdict = match req.transaction_id.as_deref() {
            Some(transaction_id) => {
                self.check_challenge_followup(req, &mut candidates, transaction_id, ct)?
            }
            None => self.check_initial(req, &mut candidates, &policy, ct)?,
        };
        Ok(verdict.into_response())
    }

    /// First call of an attempt: immediate checks, then challenge creation.
    /// The first token that accepts immediately short-circuits the attempt -
    /// no challenge is created for any other token.
    fn check_initial(
        &self,
        req: &CheckRequest,
        candidates: &mut [Token],
        policy: &PolicyView,
        ct: Duration,
    ) -> Result<AuthVerdict, OperationError> {
        for token in candidates.iter_mut() {
            if !token.is_usable() {
                security_info!(serial = %token.serial, "token skipped, not usable");
                continue;
            }
            if TokenClass::of(token).challenge_only() {
                continue;
            }
            match self.check_one_token(token, &req.password, ct) {
                Ok(true) => {
                    token.reset_fail();
                    let serial = token.serial.clone();
                    self.tokens.save(token.clone())?;
                    security_info!(serial = %serial, "immediate check -> Result::Success");
                    self.audit(AuditEvent::AuthenticationGranted {
                        who: req.user_or_serial.clone(),
                        serial: serial.clone(),
                        ct,
                    });
                    return Ok(AuthVerdict::Accept { serial });
                }
                Ok(false) => {
                    token.inc_fail();
                    self.tokens.save(token.clone())?;
                }
                Err(e) => {
                    // This token contributes "no match", the attempt goes on.
                    security_error!(serial = %token.serial, err = ?e, "token check demoted to no match");
                }
            }
        }

        // No immediate winner. Give every challenge-capable token its turn.
        let transaction_id = new_transaction_id();
        let mut multi_challenge = Vec::new();
        let mut classes = Vec::new();
        for token in candidates.iter() {
            let class = TokenClass::of(token);
            if !token.is_usable() || !class.supports_challenge(policy) {
                continue;
            }
            // A challenge is triggered by presenting the token PIN alone.
            if !token.check_pin(&req.password) {
                continue;
            }
            match self.create_one_challenge(token, class, &transaction_id, policy, ct) {
                Ok(detail) => {
                    multi_challenge.push(detail);
                    classes.push(class);
                }
                Err(OperationError::Transport(msg)) => {
                    // Unreachable transport with polling denied surfaces.
                    return Err(OperationError::Transport(msg));
                }
                Err(e) => {
                    security_error!(serial = %token.serial, err = ?e, "challenge creation demoted");
                }
            }
        }

        if multi_challenge.is_empty() {
            security_info!(who = %req.user_or_serial, "authentication denied");
            self.audit(AuditEvent::AuthenticationDenied {
                who: req.user_or_serial.clone(),
                reason: BAD_OTP_MSG,
                ct,
            });
            return Ok(AuthVerdict::Reject {
                challenge_status: None,
            });
        }

        self.audit(AuditEvent::ChallengeIssued {
            who: req.user_or_serial.clone(),
            transaction_id: transaction_id.clone(),
            serials: multi_challenge.iter().map(|c| c.serial.clone()).collect(),
            ct,
        });

        // Blocking wait applies when the attempt produced push challenges
        // exclusively.
        if let Some(timeout) = policy.push_wait {
            if classes.iter().all(|c| *c == TokenClass::Push) {
                return self.wait_for_push(req, &transaction_id, &multi_challenge, timeout, ct);
            }
        }

        Ok(AuthVerdict::Challenge {
            transaction_id,
            multi_challenge,
        })
    }

    fn wait_for_push(
        &self,
        req: &CheckRequest,
        transaction_id: &str,
        multi_challenge: &[ChallengeDetail],
        timeout: Duration,
        ct: Duration,
    ) -> Result<AuthVerdict, OperationError> {
        let status = push::wait_for_resolution(
            self.challenges,
            transaction_id,
            timeout,
            self.config.wait_poll_interval,
            ct,
        )?;
        for chal in multi_challenge {
            let _ = self.challenges.janitor(&chal.serial, ct);
        }
        match status {
            ChallengeStatus::Accepted => {
                let serial = multi_challenge
                    .first()
                    .map(|c| c.serial.clone())
                    .unwrap_or_default();
                self.audit(AuditEvent::AuthenticationGranted {
                    who: req.user_or_serial.clone(),
                    serial: serial.clone(),
                    ct,
                });
                Ok(AuthVerdict::Accept { serial })
            }
            ChallengeStatus::Declined => {
                self.audit(AuditEvent::AuthenticationDenied {
                    who: req.user_or_serial.clone(),
                    reason: "challenge declined",
                    ct,
                });
                Ok(AuthVerdict::Declined)
            }
            status => {
                self.audit(AuditEvent::AuthenticationDenied {
                    who: req.user_or_serial.clone(),
                    reason: "challenge unanswered",
                    ct,
                });
                Ok(AuthVerdict::Reject {
                    challenge_status: Some(status),
                })
            }
        }
    }

    /// Follow-up call carrying a transaction id: collect the challenges of
    /// the attempt across all participating tokens and accept when at least
    /// one resolves accepted. Declined is reported distinctly from simply
    /// not-yet-answered. The janitor runs for every serial afterwards,
    /// regardless of outcome.
    fn check_challenge_followup(
        &self,
        req: &CheckRequest,
        candidates: &mut [Token],
        transaction_id: &str,
        ct: Duration,
    ) -> Result<AuthVerdict, OperationError> {
        let rows = self.challenges.list_by_transaction(transaction_id)?;

        let mut accepted_serial = None;
        let mut any_declined = false;
        let mut any_open = false;
        let mut serials = Vec::new();

        for chal in &rows {
            serials.push(chal.serial.clone());
            let Some(token) = candidates.iter_mut().find(|t| t.serial == chal.serial) else {
                continue;
            };
            let outcome = self.check_one_challenge_response(token, chal, &req.password, ct);
            self.tokens.save(token.clone())?;
            match outcome {
                Ok(ChallengeStatus::Accepted) => {
                    accepted_serial = Some(chal.serial.clone());
                    break;
                }
                Ok(ChallengeStatus::Declined) => any_declined = true,
                Ok(ChallengeStatus::Open) => any_open = true,
                Ok(ChallengeStatus::Expired) => {}
                Err(e) => {
                    security_error!(serial = %chal.serial, err = ?e, "challenge response demoted");
                }
            }
        }

        for serial in &serials {
            let _ = self.challenges.janitor(serial, ct);
        }

        if let Some(serial) = accepted_serial {
            if let Some(token) = candidates.iter_mut().find(|t| t.serial == serial) {
                token.reset_fail();
                self.tokens.save(token.clone())?;
            }
            security_info!(serial = %serial, "challenge response -> Result::Success");
            self.audit(AuditEvent::AuthenticationGranted {
                who: req.user_or_serial.clone(),
                serial: serial.clone(),
                ct,
            });
            return Ok(AuthVerdict::Accept { serial });
        }
        if any_declined {
            security_info!(who = %req.user_or_serial, "challenge response -> Result::Declined");
            self.audit(AuditEvent::AuthenticationDenied {
                who: req.user_or_serial.clone(),
                reason: "challenge declined",
                ct,
            });
            return Ok(AuthVerdict::Declined);
        }

        security_info!(who = %req.user_or_serial, "challenge response -> Result::Denied");
        self.audit(AuditEvent::AuthenticationDenied {
            who: req.user_or_serial.clone(),
            reason: BAD_OTP_MSG,
            ct,
        });
        Ok(AuthVerdict::Reject {
            challenge_status: Some(if any_open {
                ChallengeStatus::Open
            } else {
                ChallengeStatus::Expired
            }),
        })
    }

    /// Immediate single-shot check of one token. `check_otp` capability;
    /// challenge-only types default to "no match" here.
    fn check_one_token(
        &self,
        token: &mut Token,
        presented: &str,
        ct: Duration,
    ) -> Result<bool, OperationError> {
        match TokenClass::of(token) {
            TokenClass::StaticPass => Ok(token.check_pin(presented)),
            TokenClass::Hotp => {
                let Some(otp) = token.split_pin_otp(presented) else {
                    return Ok(false);
                };
                let otp = otp.to_string();
                let hotp = Hotp::new(token.secret().clone(), token.digits, token.algo);
                match hotp.check(&otp, token.counter, self.config.hotp_window)? {
                    CheckOutcome::Match(idx) => {
                        token.commit_counter(idx + 1);
                        token.info.remove(INFO_RESYNC_STATE);
                        Ok(true)
                    }
                    CheckOutcome::NoMatch if self.config.auto_resync => {
                        self.try_auto_resync(token, &hotp, &otp, ct)
                    }
                    CheckOutcome::NoMatch => Ok(false),
                }
            }
            TokenClass::Totp => {
                let Some(otp) = token.split_pin_otp(presented) else {
                    return Ok(false);
                };
                let otp = otp.to_string();
                let totp = Totp::new(
                    token.secret().clone(),
                    token.digits,
                    token.algo,
                    self.config.totp_step,
                );
                let last = token
                    .info
                    .get(INFO_TOTP_LAST_COUNTER)
                    .and_then(|v| v.parse::<u64>().ok());
                match totp.check(&otp, ct, self.config.totp_drift, last)? {
                    CheckOutcome::Match(idx) => {
                        token.info.set(INFO_TOTP_LAST_COUNTER, idx.to_string());
                        Ok(true)
                    }
                    CheckOutcome::NoMatch => Ok(false),
                }
            }
            // No immediate check capability.
            TokenClass::Push | TokenClass::IndexedSecret => Ok(false),
        }
    }

    /// The two-step confirmation that guards against accepting a stray
    /// match somewhere in the huge sync window.
    fn try_auto_resync(
        &self,
        token: &mut Token,
        hotp: &Hotp,
        otp: &str,
        ct: Duration,
    ) -> Result<bool, OperationError> {
        let prev = token
            .info
            .get(INFO_RESYNC_STATE)
            .and_then(ResyncState::decode);
        match hotp.auto_resync(
            otp,
            token.counter,
            prev.as_ref(),
            self.config.hotp_sync_window,
            self.config.resync_due,
            ct,
        )? {
            ResyncOutcome::Accepted { new_counter } => {
                token.info.remove(INFO_RESYNC_STATE);
                token.commit_counter(new_counter);
                security_info!(serial = %token.serial, "hotp autoresync confirmed");
                Ok(true)
            }
            ResyncOutcome::Pending(state) => {
                token.info.set(INFO_RESYNC_STATE, state.encode());
                security_info!(serial = %token.serial, "hotp autoresync candidate recorded");
                Ok(false)
            }
            ResyncOutcome::Failed => {
                token.info.remove(INFO_RESYNC_STATE);
                Ok(false)
            }
        }
    }

    /// `create_challenge` capability for one token.
    fn create_one_challenge(
        &self,
        token: &Token,
        class: TokenClass,
        transaction_id: &str,
        policy: &PolicyView,
        ct: Duration,
    ) -> Result<ChallengeDetail, OperationError> {
        match class {
            TokenClass::Push => push::create_challenge(
                token,
                transaction_id,
                self.challenges,
                self.transport,
                policy,
                self.config,
                ct,
            ),
            TokenClass::IndexedSecret => {
                let secret_len = std::str::from_utf8(token.secret().expose())
                    .map_err(|_| OperationError::Crypto)?
                    .chars()
                    .count();
                let positions = indexed::random_positions(policy.indexed_positions, secret_len);
                let data = indexed::encode_positions(&positions);
                let message = format!(
                    "Please enter the positions {} from your secret.",
                    positions
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.challenges.create(Challenge::new(
                    &token.serial,
                    transaction_id,
                    data.clone(),
                    message.clone(),
                    ct,
                    self.config.challenge_validity,
                ))?;
                let mut detail = ChallengeDetail {
                    serial: token.serial.clone(),
                    transaction_id: transaction_id.to_string(),
                    message,
                    client_mode: ClientMode::Interactive,
                    attributes: Default::default(),
                };
                detail.attributes.insert("positions".to_string(), data);
                Ok(detail)
            }
            TokenClass::Hotp | TokenClass::Totp => {
                self.challenges.create(Challenge::new(
                    &token.serial,
                    transaction_id,
                    String::new(),
                    "please enter the otp value".to_string(),
                    ct,
                    self.config.challenge_validity,
                ))?;
                Ok(ChallengeDetail {
                    serial: token.serial.clone(),
                    transaction_id: transaction_id.to_string(),
                    message: "please enter the otp value".to_string(),
                    client_mode: ClientMode::Interactive,
                    attributes: Default::default(),
                })
            }
            // No challenge support.
            TokenClass::StaticPass => Err(OperationError::InvalidTokenState),
        }
    }

    /// `check_challenge_response` capability for one token against one of
    /// its challenge rows. The returned status is the canonical view of
    /// that row after the check.
    fn check_one_challenge_response(
        &self,
        token: &mut Token,
        chal: &Challenge,
        presented: &str,
        ct: Duration,
    ) -> Result<ChallengeStatus, OperationError> {
        // Resolved or expired rows report their state; only open ones take
        // an answer.
        match chal.status_at(ct) {
            ChallengeStatus::Open => {}
            status => return Ok(status),
        }
        if chal.received_count >= self.config.challenge_max_attempts {
            security_error!(serial = %token.serial, "challenge exceeded its attempt budget");
            return Ok(ChallengeStatus::Open);
        }

        let accepted = match TokenClass::of(token) {
            // An open push challenge is simply not answered yet - the
            // smartphone resolves it out of band.
            TokenClass::Push => return Ok(ChallengeStatus::Open),
            TokenClass::IndexedSecret => {
                let positions = indexed::decode_positions(&chal.data).ok_or_else(|| {
                    OperationError::Parameter("challenge data is not a position set".to_string())
                })?;
                let secret = std::str::from_utf8(token.secret().expose())
                    .map_err(|_| OperationError::Crypto)?;
                indexed::check_response(secret, &positions, presented)
            }
            TokenClass::Hotp => {
                let hotp = Hotp::new(token.secret().clone(), token.digits, token.algo);
                match hotp.check(presented, token.counter, self.config.hotp_window)? {
                    CheckOutcome::Match(idx) => {
                        token.commit_counter(idx + 1);
                        true
                    }
                    CheckOutcome::NoMatch => false,
                }
            }
            TokenClass::Totp => {
                let totp = Totp::new(
                    token.secret().clone(),
                    token.digits,
                    token.algo,
                    self.config.totp_step,
                );
                let last = token
                    .info
                    .get(INFO_TOTP_LAST_COUNTER)
                    .and_then(|v| v.parse::<u64>().ok());
                match totp.check(presented, ct, self.config.totp_drift, last)? {
                    CheckOutcome::Match(idx) => {
                        token.info.set(INFO_TOTP_LAST_COUNTER, idx.to_string());
                        true
                    }
                    CheckOutcome::NoMatch => false,
                }
            }
            // No challenge support.
            TokenClass::StaticPass => false,
        };

        self.challenges
            .update(&chal.serial, &chal.transaction_id, &mut |c| {
                c.record_attempt(accepted)
            })?;
        if accepted {
            Ok(ChallengeStatus::Accepted)
        } else {
            token.inc_fail();
            Ok(ChallengeStatus::Open)
        }
    }
}
