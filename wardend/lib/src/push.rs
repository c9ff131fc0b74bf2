//! The push token confirmation protocol.
//!
//! Enrollment is a two phase handshake: step one creates the token with a
//! one-time enrollment credential and hands the client an enrollment URL;
//! step two is the smartphone presenting that credential together with its
//! public key, upon which the server generates its own key pair and the
//! token becomes usable.
//!
//! Authentication is asynchronous: the server signs a nonce challenge and
//! pushes it to the device, and the device answers - either to the
//! notification or after polling for open challenges - with a signature the
//! server verifies against the smartphone public key stored at enrollment.
//! The authenticating client meanwhile polls the challenge by transaction
//! id, or blocks in push-wait mode until the challenge resolves.

use std::time::{Duration, Instant};

use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use rand::prelude::*;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::challenge::{Challenge, ChallengeStore};
use crate::prelude::*;
use crate::token::Token;
use crate::transport::{PushPayload, PushTransport};

/// Tokeninfo keys the protocol owns.
pub const INFO_ENROLLMENT_CREDENTIAL: &str = "enrollment_credential";
pub const INFO_ENROLLMENT_DUE: &str = "enrollment_due";
pub const INFO_PUBKEY_SMARTPHONE: &str = "public_key_smartphone";
pub const INFO_PUBKEY_SERVER: &str = "public_key_server";
pub const INFO_FB_TOKEN: &str = "firebase_token";

const SSLVERIFY: &str = "1";
const DECLINE_MARKER: &str = "decline";

const ENROLL_STATE_MSG: &str = "token is not waiting for enrollment";

/// Begin the enrollment handshake. The token moves to `clientwait` and a
/// one-time credential binds the eventual step two call to this token.
pub fn enroll_start(
    token: &mut Token,
    config: &EngineConfig,
    ct: Duration,
) -> Result<EnrollUrlDetail, OperationError> {
    if token.token_type != TokenType::Push {
        return Err(OperationError::Parameter(
            "token does not support push enrollment".to_string(),
        ));
    }

    let credential = hex::encode(crate::credential::SecretBuf::generate(20).expose());
    token
        .info
        .set_secret(INFO_ENROLLMENT_CREDENTIAL, credential.clone());
    let due = ct + config.challenge_validity;
    token
        .info
        .set(INFO_ENROLLMENT_DUE, due.as_secs().to_string());
    token.rollout_state = RolloutState::ClientWait;
    // Not usable for authentication until the handshake completes.
    token.active = false;

    let mut url = Url::parse(&config.registration_url)
        .map_err(|_| OperationError::Parameter("registration url is not parseable".to_string()))?;
    url.query_pairs_mut()
        .append_pair("serial", &token.serial)
        .append_pair("ttl", &config.push_ttl_minutes.to_string())
        .append_pair("issuer", &config.issuer)
        .append_pair("enrollment_credential", &credential);

    security_info!(serial = %token.serial, "push enrollment step one complete");

    Ok(EnrollUrlDetail {
        url: url.to_string(),
        ttl_minutes: config.push_ttl_minutes,
        issuer: config.issuer.clone(),
        serial: token.serial.clone(),
    })
}

/// Complete the enrollment handshake from the smartphone. Only honored in
/// `clientwait`, only with the exact credential from step one, and only
/// once - the stored credential is deleted on success.
pub fn enroll_finish(
    token: &mut Token,
    req: &EnrollFinishRequest,
    config: &EngineConfig,
    ct: Duration,
) -> Result<(), OperationError> {
    if token.rollout_state != RolloutState::ClientWait {
        security_error!(serial = %token.serial, "enrollment step two outside clientwait");
        return Err(OperationError::State(ENROLL_STATE_MSG.to_string()));
    }

    let stored = token
        .info
        .get(INFO_ENROLLMENT_CREDENTIAL)
        .ok_or_else(|| OperationError::State(ENROLL_STATE_MSG.to_string()))?;

    // An expired credential is indistinguishable from a wrong state.
    let due = token
        .info
        .get(INFO_ENROLLMENT_DUE)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .ok_or_else(|| OperationError::State(ENROLL_STATE_MSG.to_string()))?;
    if ct > due {
        security_error!(serial = %token.serial, "enrollment credential expired");
        return Err(OperationError::State(ENROLL_STATE_MSG.to_string()));
    }

    if stored.len() != req.enrollment_credential.len()
        || !memcmp::eq(stored.as_bytes(), req.enrollment_credential.as_bytes())
    {
        security_error!(serial = %token.serial, "enrollment credential mismatch");
        return Err(OperationError::Parameter(
            "invalid enrollment credential".to_string(),
        ));
    }

    // Validate the smartphone key before mutating anything.
    PKey::public_key_from_pem(req.pubkey.as_bytes())
        .map_err(|_| OperationError::Parameter("smartphone public key not parseable".to_string()))?;

    // Single use, straight away.
    token.info.remove(INFO_ENROLLMENT_CREDENTIAL);
    token.info.remove(INFO_ENROLLMENT_DUE);

    token.info.set(INFO_PUBKEY_SMARTPHONE, req.pubkey.clone());
    token.info.set(INFO_FB_TOKEN, req.fbtoken.clone());

    // Our half of the key exchange. The private key lives in the token's
    // encrypted secret slot; it is asymmetric, so no shared hmac key is
    // required for this token type.
    let rsa = Rsa::generate(config.push_key_bits).map_err(|_| OperationError::Crypto)?;
    let pkey = PKey::from_rsa(rsa).map_err(|_| OperationError::Crypto)?;
    let private_pem = pkey
        .private_key_to_pem_pkcs8()
        .map_err(|_| OperationError::Crypto)?;
    let public_pem = pkey
        .public_key_to_pem()
        .map_err(|_| OperationError::Crypto)?;
    token.set_secret(crate::credential::SecretBuf::new(private_pem));
    token.info.set(
        INFO_PUBKEY_SERVER,
        String::from_utf8(public_pem).map_err(|_| OperationError::Crypto)?,
    );

    token.rollout_state = RolloutState::Enrolled;
    token.active = true;

    security_info!(serial = %token.serial, "push enrollment complete");
    Ok(())
}

fn sign_with_server_key(token: &Token, parts: &[&str]) -> Result<String, OperationError> {
    let pkey = PKey::private_key_from_pem(token.secret().expose())
        .map_err(|_| OperationError::Crypto)?;
    let mut signer =
        Signer::new(MessageDigest::sha256(), &pkey).map_err(|_| OperationError::Crypto)?;
    signer
        .update(parts.join("|").as_bytes())
        .map_err(|_| OperationError::Crypto)?;
    let sig = signer.sign_to_vec().map_err(|_| OperationError::Crypto)?;
    Ok(hex::encode(sig))
}

/// Verify a smartphone signature over `parts` joined with `|`. A bad
/// signature is a logical false, never an error - only unusable stored key
/// material errors out.
fn verify_smartphone_signature(
    token: &Token,
    parts: &[&str],
    signature_hex: &str,
) -> Result<bool, OperationError> {
    let pem = token
        .info
        .get(INFO_PUBKEY_SMARTPHONE)
        .ok_or(OperationError::Crypto)?;
    let pkey = PKey::public_key_from_pem(pem.as_bytes()).map_err(|_| OperationError::Crypto)?;
    let sig = match hex::decode(signature_hex) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    let mut verifier =
        Verifier::new(MessageDigest::sha256(), &pkey).map_err(|_| OperationError::Crypto)?;
    verifier
        .update(parts.join("|").as_bytes())
        .map_err(|_| OperationError::Crypto)?;
    Ok(verifier.verify(&sig).unwrap_or(false))
}

/// Reject a signed smartphone request whose timestamp is unparseable or
/// outside the tolerance window. Runs before any signature work.
fn check_timestamp(raw: &str, ct: Duration, tolerance: Duration) -> Result<(), OperationError> {
    let ts = OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| OperationError::Timestamp)?;
    let skew = (ts.unix_timestamp() - ct.as_secs() as i64).unsigned_abs();
    if skew > tolerance.as_secs() {
        security_error!("smartphone request timestamp outside the permitted window");
        return Err(OperationError::Timestamp);
    }
    Ok(())
}

/// The nonce of a challenge row - the head of the stored data.
fn challenge_nonce(challenge: &Challenge) -> &str {
    challenge.data.split(',').next().unwrap_or("")
}

/// The correct presence answer of a challenge row, when it carries one.
/// The stored convention is load-bearing: the tail of the comma joined data
/// is the option list, and its LAST element is always the correct answer.
fn presence_answer_of(challenge: &Challenge) -> Option<&str> {
    let mut parts = challenge.data.split(',');
    let _nonce = parts.next()?;
    parts.next_back()
}

/// Create a push challenge for an enrolled token: sign the nonce payload,
/// hand it to the transport best-effort, and persist the challenge row. A
/// delivery failure only aborts when polling is denied too - then nothing is
/// persisted and the transport error surfaces.
pub fn create_challenge(
    token: &Token,
    transaction_id: &str,
    store: &dyn ChallengeStore,
    transport: &dyn PushTransport,
    policy: &PolicyView,
    config: &EngineConfig,
    ct: Duration,
) -> Result<ChallengeDetail, OperationError> {
    if token.rollout_state != RolloutState::Enrolled {
        return Err(OperationError::State(
            "push token enrollment is not complete".to_string(),
        ));
    }
    let fb_token = token
        .info
        .get(INFO_FB_TOKEN)
        .ok_or(OperationError::InvalidTokenState)?;

    let nonce = Uuid::new_v4().simple().to_string();
    let mut data = nonce.clone();
    let mut question = policy.push_question.clone();

    if policy.require_presence {
        let values = policy.presence_alphabet.values();
        if values.is_empty() {
            return Err(OperationError::Parameter(
                "presence alphabet is empty".to_string(),
            ));
        }
        let count = policy.presence_options.clamp(1, values.len());
        let mut rng = rand::thread_rng();
        let mut chosen: Vec<String> = values.choose_multiple(&mut rng, count).cloned().collect();
        // Draw the correct option and keep it at the tail of the stored
        // list. Which position the user sees it at is up to the client.
        let correct_idx = rng.gen_range(0..chosen.len());
        let correct = chosen.remove(correct_idx);
        chosen.push(correct);

        question = format!("{} Press: {}", question, chosen.join(", "));
        data = format!("{},{}", data, chosen.join(","));
    }

    let signature = sign_with_server_key(
        token,
        &[
            &nonce,
            &config.registration_url,
            &token.serial,
            &question,
            &policy.push_title,
            SSLVERIFY,
        ],
    )?;
    let payload = PushPayload {
        nonce: nonce.clone(),
        url: config.registration_url.clone(),
        serial: token.serial.clone(),
        question: question.clone(),
        title: policy.push_title.clone(),
        sslverify: SSLVERIFY.to_string(),
        signature,
    };

    if let Err(e) = transport.send(fb_token, &payload) {
        if !policy.allow_polling {
            push_error!(serial = %token.serial, "push delivery failed and polling is denied");
            return Err(e);
        }
        push_warn!(serial = %token.serial, "push delivery failed, relying on polling");
    }

    store.create(Challenge::new(
        &token.serial,
        transaction_id,
        data,
        question,
        ct,
        config.challenge_validity,
    ))?;

    let mut detail = ChallengeDetail {
        serial: token.serial.clone(),
        transaction_id: transaction_id.to_string(),
        message: "Please confirm the authentication on your mobile device!".to_string(),
        client_mode: ClientMode::Poll,
        attributes: Default::default(),
    };
    if policy.require_presence {
        detail
            .attributes
            .insert("require_presence".to_string(), "1".to_string());
    }
    Ok(detail)
}

/// The smartphone answering a challenge, from either delivery path. The
/// signature is verified against the smartphone public key; a validly
/// signed decline resolves the challenge as declined.
pub fn confirm(
    token: &Token,
    req: &PushConfirmRequest,
    store: &dyn ChallengeStore,
    config: &EngineConfig,
    ct: Duration,
) -> Result<bool, OperationError> {
    let open = store.list_open_for_serial(&req.serial, ct)?;
    let Some(challenge) = open
        .into_iter()
        .find(|c| challenge_nonce(c) == req.nonce)
    else {
        security_info!(serial = %req.serial, "no open challenge for presented nonce");
        return Ok(false);
    };

    if challenge.received_count >= config.challenge_max_attempts {
        security_error!(serial = %req.serial, "challenge exceeded its attempt budget");
        return Ok(false);
    }

    let mut parts: Vec<&str> = vec![req.nonce.as_str(), req.serial.as_str()];
    if req.decline {
        parts.push(DECLINE_MARKER);
    } else if let Some(answer) = req.presence_answer.as_deref() {
        parts.push(answer);
    }

    if !verify_smartphone_signature(token, &parts, &req.signature)? {
        security_error!(serial = %req.serial, "push confirmation signature invalid");
        store.update(&challenge.serial, &challenge.transaction_id, &mut |c| {
            c.record_attempt(false)
        })?;
        return Ok(false);
    }

    if req.decline {
        store.update(&challenge.serial, &challenge.transaction_id, &mut |c| {
            c.received_count = c.received_count.saturating_add(1);
            c.status = ChallengeStatus::Declined;
        })?;
        security_info!(serial = %req.serial, "user declined the authentication");
        return Ok(true);
    }

    if let Some(correct) = presence_answer_of(&challenge) {
        let presented = req.presence_answer.as_deref().unwrap_or("");
        let matches =
            presented.len() == correct.len() && memcmp::eq(presented.as_bytes(), correct.as_bytes());
        if !matches {
            push_warn!(serial = %req.serial, "presence answer missing or wrong");
            store.update(&challenge.serial, &challenge.transaction_id, &mut |c| {
                c.record_attempt(false)
            })?;
            return Ok(false);
        }
    }

    store.update(&challenge.serial, &challenge.transaction_id, &mut |c| {
        c.record_attempt(true)
    })?;
    security_info!(serial = %req.serial, "push challenge confirmed");
    Ok(true)
}

/// The smartphone pulling open challenges when no notification arrived.
/// Timestamp guard first, then policy, then the request signature; each
/// returned challenge is signed by the server so the app can verify it.
pub fn poll(
    token: &Token,
    req: &PollRequest,
    store: &dyn ChallengeStore,
    policy: &PolicyView,
    config: &EngineConfig,
    ct: Duration,
) -> Result<Vec<PendingChallenge>, OperationError> {
    check_timestamp(&req.timestamp, ct, config.timestamp_tolerance)?;

    if !policy.allow_polling {
        return Err(OperationError::Policy(
            "polling for challenges is not allowed".to_string(),
        ));
    }

    if !verify_smartphone_signature(
        token,
        &[req.serial.as_str(), req.timestamp.as_str()],
        &req.signature,
    )? {
        security_error!(serial = %req.serial, "poll request signature invalid");
        return Ok(Vec::new());
    }

    let open = store.list_open_for_serial(&req.serial, ct)?;
    open.iter()
        .map(|c| {
            let nonce = challenge_nonce(c);
            let signature = sign_with_server_key(
                token,
                &[
                    nonce,
                    &config.registration_url,
                    &token.serial,
                    &c.message,
                    &policy.push_title,
                    SSLVERIFY,
                ],
            )?;
            Ok(PendingChallenge {
                nonce: nonce.to_string(),
                url: config.registration_url.clone(),
                serial: token.serial.clone(),
                question: c.message.clone(),
                title: policy.push_title.clone(),
                sslverify: SSLVERIFY.to_string(),
                signature,
            })
        })
        .collect()
}

/// The smartphone rotating its transport registration token. Same guards as
/// polling; the signature authenticates the new token value itself.
pub fn update_fb_token(
    token: &mut Token,
    req: &FbTokenUpdateRequest,
    config: &EngineConfig,
    ct: Duration,
) -> Result<(), OperationError> {
    check_timestamp(&req.timestamp, ct, config.timestamp_tolerance)?;

    if !verify_smartphone_signature(
        token,
        &[
            req.new_fb_token.as_str(),
            req.serial.as_str(),
            req.timestamp.as_str(),
        ],
        &req.signature,
    )? {
        security_error!(serial = %req.serial, "firebase token update signature invalid");
        return Err(OperationError::Parameter(
            "invalid request signature".to_string(),
        ));
    }

    token.info.set(INFO_FB_TOKEN, req.new_fb_token.clone());
    security_info!(serial = %req.serial, "push transport token rotated");
    Ok(())
}

/// Block until the challenges of a transaction resolve, or the timeout runs
/// out. Each iteration reads the store fresh and sleeps without holding any
/// lock, so the smartphone's confirmation can land concurrently.
///
/// Returns the aggregate status: `Accepted` as soon as any challenge is
/// accepted, `Declined`/`Expired` once none are open any more, and `Open`
/// on timeout.
pub fn wait_for_resolution(
    store: &dyn ChallengeStore,
    transaction_id: &str,
    timeout: Duration,
    interval: Duration,
    start_ct: Duration,
) -> Result<ChallengeStatus, OperationError> {
    let started = Instant::now();
    loop {
        let ct = start_ct + started.elapsed();
        let rows = store.list_by_transaction(transaction_id)?;
        if rows.is_empty() {
            return Err(OperationError::NotFound);
        }

        let statuses: Vec<ChallengeStatus> = rows.iter().map(|c| c.status_at(ct)).collect();
        if statuses.iter().any(|s| *s == ChallengeStatus::Accepted) {
            return Ok(ChallengeStatus::Accepted);
        }
        if !statuses.iter().any(|s| *s == ChallengeStatus::Open) {
            if statuses.iter().any(|s| *s == ChallengeStatus::Declined) {
                return Ok(ChallengeStatus::Declined);
            }
            return Ok(ChallengeStatus::Expired);
        }
        if started.elapsed() >= timeout {
            // Still unanswered.
            return Ok(ChallengeStatus::Open);
        }
        std::thread::sleep(interval.min(timeout.saturating_sub(started.elapsed())));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::sign::{Signer, Verifier};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    use super::*;
    use crate::challenge::{new_transaction_id, ChallengeStore, MemoryChallengeStore};
    use crate::config::{EngineConfig, PolicyView, PresenceAlphabet};
    use crate::credential::SecretBuf;
    use crate::token::Token;
    use crate::transport::{FailingTransport, RecordingTransport};

    fn test_config() -> EngineConfig {
        EngineConfig {
            push_key_bits: 2048,
            ..EngineConfig::default()
        }
    }

    fn phone_keypair() -> PKey<Private> {
        let rsa = Rsa::generate(2048).expect("failed to generate rsa key");
        PKey::from_rsa(rsa).expect("failed to wrap rsa key")
    }

    fn phone_sign(key: &PKey<Private>, parts: &[&str]) -> String {
        let mut signer = Signer::new(MessageDigest::sha256(), key).expect("failed to sign");
        signer
            .update(parts.join("|").as_bytes())
            .expect("failed to sign");
        hex::encode(signer.sign_to_vec().expect("failed to sign"))
    }

    fn rfc3339_at(ct: Duration) -> String {
        OffsetDateTime::from_unix_timestamp(ct.as_secs() as i64)
            .expect("failed to build timestamp")
            .format(&Rfc3339)
            .expect("failed to format timestamp")
    }

    /// Run both enrollment steps, returning the enrolled token and the
    /// smartphone private key.
    fn enrolled_token(config: &EngineConfig, ct: Duration) -> (Token, PKey<Private>) {
        tracery::test_init();
        let mut token = Token::new("PUSH0001", TokenType::Push, SecretBuf::generate(20));
        let detail = enroll_start(&mut token, config, ct).expect("failed to start enrollment");
        assert!(detail.url.contains("PUSH0001"));
        assert!(token.rollout_state == RolloutState::ClientWait);

        let credential = token
            .info
            .get(INFO_ENROLLMENT_CREDENTIAL)
            .expect("missing enrollment credential")
            .to_string();
        let phone = phone_keypair();
        let pubkey = String::from_utf8(
            phone
                .public_key_to_pem()
                .expect("failed to encode public key"),
        )
        .expect("failed to encode public key");

        let req = EnrollFinishRequest {
            serial: "PUSH0001".to_string(),
            enrollment_credential: credential,
            pubkey,
            fbtoken: "fb-registration-token".to_string(),
        };
        enroll_finish(&mut token, &req, config, ct).expect("failed to finish enrollment");
        (token, phone)
    }

    #[test]
    fn test_enrollment_handshake_and_single_use() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, _phone) = enrolled_token(&config, ct);

        assert!(token.rollout_state == RolloutState::Enrolled);
        assert!(token.active);
        assert!(token.info.get(INFO_PUBKEY_SMARTPHONE).is_some());
        assert!(token.info.get(INFO_PUBKEY_SERVER).is_some());
        assert!(token.info.get(INFO_FB_TOKEN) == Some("fb-registration-token"));
        // The credential is consumed - an identical replay of step two must
        // now fail with a state error.
        assert!(token.info.get(INFO_ENROLLMENT_CREDENTIAL).is_none());

        let mut replayed = token.clone();
        let req = EnrollFinishRequest {
            serial: "PUSH0001".to_string(),
            enrollment_credential: "anything".to_string(),
            pubkey: String::new(),
            fbtoken: String::new(),
        };
        assert!(matches!(
            enroll_finish(&mut replayed, &req, &config, ct),
            Err(OperationError::State(_))
        ));
    }

    #[test]
    fn test_enrollment_rejects_tampered_credential() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let mut token = Token::new("PUSH0002", TokenType::Push, SecretBuf::generate(20));
        enroll_start(&mut token, &config, ct).expect("failed to start enrollment");

        let phone = phone_keypair();
        let pubkey = String::from_utf8(
            phone
                .public_key_to_pem()
                .expect("failed to encode public key"),
        )
        .expect("failed to encode public key");
        let req = EnrollFinishRequest {
            serial: "PUSH0002".to_string(),
            enrollment_credential: "00".repeat(20),
            pubkey,
            fbtoken: "fb".to_string(),
        };
        assert!(matches!(
            enroll_finish(&mut token, &req, &config, ct),
            Err(OperationError::Parameter(_))
        ));
        // No transition happened.
        assert!(token.rollout_state == RolloutState::ClientWait);
        assert!(token.info.get(INFO_ENROLLMENT_CREDENTIAL).is_some());
    }

    #[test]
    fn test_enrollment_credential_expires_like_wrong_state() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let mut token = Token::new("PUSH0003", TokenType::Push, SecretBuf::generate(20));
        enroll_start(&mut token, &config, ct).expect("failed to start enrollment");
        let credential = token
            .info
            .get(INFO_ENROLLMENT_CREDENTIAL)
            .expect("missing enrollment credential")
            .to_string();

        let phone = phone_keypair();
        let pubkey = String::from_utf8(
            phone
                .public_key_to_pem()
                .expect("failed to encode public key"),
        )
        .expect("failed to encode public key");
        let req = EnrollFinishRequest {
            serial: "PUSH0003".to_string(),
            enrollment_credential: credential,
            pubkey,
            fbtoken: "fb".to_string(),
        };
        let late = ct + config.challenge_validity + Duration::from_secs(1);
        assert!(
            enroll_finish(&mut token, &req, &config, late)
                == Err(OperationError::State(ENROLL_STATE_MSG.to_string()))
        );
    }

    #[test]
    fn test_challenge_payload_is_server_signed() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, _phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();
        let transport = RecordingTransport::new();
        let policy = PolicyView::default();
        let txid = new_transaction_id();

        create_challenge(&token, &txid, &store, &transport, &policy, &config, ct)
            .expect("failed to create challenge");
        assert!(transport.sent_count() == 1);

        let sent = transport.sent.lock().expect("poisoned");
        let (fb_token, payload) = &sent[0];
        assert!(fb_token == "fb-registration-token");

        // The phone verifies the payload signature against the server
        // public key stored during enrollment.
        let server_pem = token
            .info
            .get(INFO_PUBKEY_SERVER)
            .expect("missing server key");
        let server_key =
            PKey::public_key_from_pem(server_pem.as_bytes()).expect("failed to parse server key");
        let mut verifier =
            Verifier::new(MessageDigest::sha256(), &server_key).expect("failed to build verifier");
        let signed = [
            payload.nonce.as_str(),
            payload.url.as_str(),
            payload.serial.as_str(),
            payload.question.as_str(),
            payload.title.as_str(),
            payload.sslverify.as_str(),
        ]
        .join("|");
        verifier.update(signed.as_bytes()).expect("failed to verify");
        let sig = hex::decode(&payload.signature).expect("failed to decode signature");
        assert!(verifier.verify(&sig).expect("failed to verify"));

        // A challenge row exists and is open.
        let rows = store.list_by_transaction(&txid).expect("failed to list");
        assert!(rows.len() == 1);
        assert!(rows[0].status == ChallengeStatus::Open);
    }

    #[test]
    fn test_confirm_accept_and_tampering() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();
        let transport = RecordingTransport::new();
        let policy = PolicyView::default();
        let txid = new_transaction_id();

        create_challenge(&token, &txid, &store, &transport, &policy, &config, ct)
            .expect("failed to create challenge");
        let nonce = {
            let sent = transport.sent.lock().expect("poisoned");
            sent[0].1.nonce.clone()
        };

        // Tampered nonce in the signed payload: logical reject, attempt
        // recorded, challenge stays open.
        let bad_sig = phone_sign(&phone, &["ffff", "PUSH0001"]);
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: bad_sig,
            decline: false,
            presence_answer: None,
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(false));
        let row = store.get("PUSH0001", &txid).expect("failed to get").expect("row missing");
        assert!(row.status == ChallengeStatus::Open);
        assert!(row.received_count == 1);

        // Signing with the wrong private key fails too.
        let stranger = phone_keypair();
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&stranger, &[nonce.as_str(), "PUSH0001"]),
            decline: false,
            presence_answer: None,
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(false));

        // The genuine signature resolves the challenge.
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&phone, &[nonce.as_str(), "PUSH0001"]),
            decline: false,
            presence_answer: None,
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(true));
        let row = store.get("PUSH0001", &txid).expect("failed to get").expect("row missing");
        assert!(row.status == ChallengeStatus::Accepted);
    }

    #[test]
    fn test_confirm_decline_is_a_distinct_terminal_state() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();
        let transport = RecordingTransport::new();
        let txid = new_transaction_id();

        create_challenge(
            &token,
            &txid,
            &store,
            &transport,
            &PolicyView::default(),
            &config,
            ct,
        )
        .expect("failed to create challenge");
        let nonce = {
            let sent = transport.sent.lock().expect("poisoned");
            sent[0].1.nonce.clone()
        };

        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&phone, &[nonce.as_str(), "PUSH0001", "decline"]),
            decline: true,
            presence_answer: None,
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(true));
        let row = store.get("PUSH0001", &txid).expect("failed to get").expect("row missing");
        assert!(row.status == ChallengeStatus::Declined);
        assert!(row.status_at(ct) == ChallengeStatus::Declined);
    }

    #[test]
    fn test_presence_correct_answer_is_last_element() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();
        let transport = RecordingTransport::new();
        let policy = PolicyView {
            require_presence: true,
            presence_alphabet: PresenceAlphabet::Numeric,
            presence_options: 4,
            ..PolicyView::default()
        };
        let txid = new_transaction_id();

        create_challenge(&token, &txid, &store, &transport, &policy, &config, ct)
            .expect("failed to create challenge");
        let row = store.get("PUSH0001", &txid).expect("failed to get").expect("row missing");
        let parts: Vec<&str> = row.data.split(',').collect();
        // nonce plus four options.
        assert!(parts.len() == 5);
        let nonce = parts[0].to_string();
        let correct = parts[4].to_string();
        let wrong = parts[1].to_string();
        assert!(wrong != correct);

        // A validly signed answer naming another listed option fails.
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&phone, &[nonce.as_str(), "PUSH0001", wrong.as_str()]),
            decline: false,
            presence_answer: Some(wrong.clone()),
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(false));

        // Omitting the answer when required fails as well.
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&phone, &[nonce.as_str(), "PUSH0001"]),
            decline: false,
            presence_answer: None,
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(false));

        // The last element of the stored list is the one that works.
        let req = PushConfirmRequest {
            serial: "PUSH0001".to_string(),
            nonce: nonce.clone(),
            signature: phone_sign(&phone, &[nonce.as_str(), "PUSH0001", correct.as_str()]),
            decline: false,
            presence_answer: Some(correct),
        };
        assert!(confirm(&token, &req, &store, &config, ct) == Ok(true));
    }

    #[test]
    fn test_transport_failure_falls_back_to_polling_or_aborts() {
        let config = test_config();
        let ct = Duration::from_secs(1000);
        let (token, _phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();

        // Polling allowed: the challenge is still persisted.
        let txid = new_transaction_id();
        create_challenge(
            &token,
            &txid,
            &store,
            &FailingTransport,
            &PolicyView::default(),
            &config,
            ct,
        )
        .expect("failed to create challenge");
        assert!(store.get("PUSH0001", &txid).expect("failed to get").is_some());

        // Polling denied: the transport error surfaces and nothing is
        // persisted.
        let txid2 = new_transaction_id();
        let policy = PolicyView {
            allow_polling: false,
            ..PolicyView::default()
        };
        assert!(matches!(
            create_challenge(&token, &txid2, &store, &FailingTransport, &policy, &config, ct),
            Err(OperationError::Transport(_))
        ));
        assert!(store.get("PUSH0001", &txid2).expect("failed to get").is_none());
    }

    #[test]
    fn test_poll_guards_and_signed_result() {
        let config = test_config();
        let ct = Duration::from_secs(100_000);
        let (token, phone) = enrolled_token(&config, ct);
        let store = MemoryChallengeStore::new();
        let transport = RecordingTransport::new();
        let policy = PolicyView::default();
        let txid = new_transaction_id();
        create_challenge(&token, &txid, &store, &transport, &policy, &config, ct)
            .expect("failed to create challenge");

        // Stale timestamp rejects before the signature is even read - a
        // garbage signature does not get the chance to matter.
        let stale = rfc3339_at(ct - config.timestamp_tolerance - Duration::from_secs(1));
        let req = PollRequest {
            serial: "PUSH0001".to_string(),
            timestamp: stale,
            signature: "not-even-hex".to_string(),
        };
        assert!(poll(&token, &req, &store, &policy, &config, ct) == Err(OperationError::Timestamp));

        // Unparseable timestamps are the same cheap reject.
        let req = PollRequest {
            serial: "PUSH0001".to_string(),
            timestamp: "yesterday-ish".to_string(),
            signature: String::new(),
        };
        assert!(poll(&token, &req, &store, &policy, &config, ct) == Err(OperationError::Timestamp));

        // Fresh timestamp, bad signature: logical empty result.
        let fresh = rfc3339_at(ct);
        let req = PollRequest {
            serial: "PUSH0001".to_string(),
            timestamp: fresh.clone(),
            signature: phone_sign(&phone, &["PUSH0001", "some other day"]),
        };
        assert!(
            poll(&token, &req, &store, &policy, &config, ct)
                .expect("failed to poll")
                .is_empty()
        );

        // Polling denied by policy.
        let no_poll = PolicyView {
            allow_polling: false,
            ..PolicyView::default()
        };
        let req = PollRequest {
            serial: "PUSH0001".to_string(),
            timestamp: fresh.clone(),
            signature: phone_sign(&phone, &["PUSH0001", fresh.as_str()]),
        };
        assert!(matches!(
            poll(&token, &req, &store, &no_poll, &config, ct),
            Err(OperationError::Policy(_))
        ));

        // The good case returns the open challenge, server signed.
        let pending = poll(&token, &req, &store, &policy, &config, ct).expect("failed to poll");
        assert!(pending.len() == 1);
        let server_pem = token
            .info
            .get(INFO_PUBKEY_SERVER)
            .expect("missing server key");
        let server_key =
            PKey::public_key_from_pem(server_pem.as_bytes()).expect("failed to parse server key");
        let mut verifier =
            Verifier::new(MessageDigest::sha256(), &server_key).expect("failed to build verifier");
        let p = &pending[0];
        let signed = [
            p.nonce.as_str(),
            p.url.as_str(),
            p.serial.as_str(),
            p.question.as_str(),
            p.title.as_str(),
            p.sslverify.as_str(),
        ]
        .join("|");
        verifier.update(signed.as_bytes()).expect("failed to verify");
        let sig = hex::decode(&p.signature).expect("failed to decode signature");
        assert!(verifier.verify(&sig).expect("failed to verify"));
    }

    #[test]
    fn test_update_fb_token() {
        let config = test_config();
        let ct = Duration::from_secs(100_000);
        let (mut token, phone) = enrolled_token(&config, ct);

        let fresh = rfc3339_at(ct);
        let req = FbTokenUpdateRequest {
            serial: "PUSH0001".to_string(),
            new_fb_token: "rotated-token".to_string(),
            timestamp: fresh.clone(),
            signature: phone_sign(&phone, &["rotated-token", "PUSH0001", fresh.as_str()]),
        };
        update_fb_token(&mut token, &req, &config, ct).expect("failed to update");
        assert!(token.info.get(INFO_FB_TOKEN) == Some("rotated-token"));

        // Stale timestamp is refused before the signature check.
        let stale = rfc3339_at(ct - config.timestamp_tolerance - Duration::from_secs(1));
        let req = FbTokenUpdateRequest {
            serial: "PUSH0001".to_string(),
            new_fb_token: "evil-token".to_string(),
            timestamp: stale,
            signature: "junk".to_string(),
        };
        assert!(update_fb_token(&mut token, &req, &config, ct) == Err(OperationError::Timestamp));

        // A bad signature with a fresh timestamp is refused too.
        let req = FbTokenUpdateRequest {
            serial: "PUSH0001".to_string(),
            new_fb_token: "evil-token".to_string(),
            timestamp: fresh.clone(),
            signature: phone_sign(&phone, &["evil-token", "PUSH0001", "other time"]),
        };
        assert!(matches!(
            update_fb_token(&mut token, &req, &config, ct),
            Err(OperationError::Parameter(_))
        ));
        assert!(token.info.get(INFO_FB_TOKEN) == Some("rotated-token"));
    }

    #[test]
    fn test_wait_for_resolution_terminal_states() {
        let store = MemoryChallengeStore::new();
        let ct = Duration::from_secs(1000);
        let interval = Duration::from_millis(10);

        // Unknown transaction.
        assert!(
            wait_for_resolution(&store, "missing", Duration::ZERO, interval, ct)
                == Err(OperationError::NotFound)
        );

        let mut chal = Challenge::new(
            "PUSH0001",
            "tx-wait",
            "nonce".to_string(),
            "q".to_string(),
            ct,
            Duration::from_secs(120),
        );
        store.create(chal.clone()).expect("failed to create");

        // Still open at timeout.
        assert!(
            wait_for_resolution(&store, "tx-wait", Duration::ZERO, interval, ct)
                == Ok(ChallengeStatus::Open)
        );

        // Accepted resolves immediately.
        store
            .update("PUSH0001", "tx-wait", &mut |c| c.record_attempt(true))
            .expect("failed to update");
        assert!(
            wait_for_resolution(&store, "tx-wait", Duration::ZERO, interval, ct)
                == Ok(ChallengeStatus::Accepted)
        );

        // Declined is reported distinctly.
        chal.transaction_id = "tx-decline".to_string();
        store.create(chal).expect("failed to create");
        store
            .update("PUSH0001", "tx-decline", &mut |c| {
                c.status = ChallengeStatus::Declined
            })
            .expect("failed to update");
        assert!(
            wait_for_resolution(&store, "tx-decline", Duration::ZERO, interval, ct)
                == Ok(ChallengeStatus::Declined)
        );
    }
}
