//! Session negotiation: outbound/inbound creation and race resolution.
//!
//! Each (re)creation of an outbound session bumps a per-peer version
//! counter. Inbound handshakes carry the version the peer believes it
//! created, which is compared against the locally stored one to reject
//! stale handshakes and to detect both sides negotiating at once.

use vodozemac::olm::{OlmMessage, SessionConfig};
use vodozemac::Curve25519PublicKey;

use gardien_shared::constants::INITIAL_ENCRYPTED_MESSAGE;
use gardien_shared::signing::{self, decode_b64};
use gardien_shared::types::{EncryptedData, IdentityKeys, PrekeyBundle};

use crate::error::SessionError;
use crate::store::{decode_olm_message, encode_olm_message, CryptoStore, SessionSlot};
use crate::Result;

/// Which side survives a detected negotiation race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    /// Keep the locally created outbound session; the peer yields.
    KeepLocal,
    /// Accept the peer's handshake with `overwrite = true`.
    AcceptRemote,
}

/// Tie-break for concurrent session creation: the device with the
/// lexicographically lower ed25519 key keeps its outbound session. Both
/// sides evaluate this with swapped arguments and reach opposite answers,
/// so exactly one session survives.
pub fn session_race_winner(local_ed25519: &str, peer_ed25519: &str) -> RaceOutcome {
    if local_ed25519 <= peer_ed25519 {
        RaceOutcome::KeepLocal
    } else {
        RaceOutcome::AcceptRemote
    }
}

impl CryptoStore {
    /// Create (or re-create) an outbound session to a peer device.
    ///
    /// The peer's prekey signature is verified against its identity key
    /// before any handshake happens. With a one-time key present the
    /// standard handshake is used; without one, the signed prekey alone
    /// carries the exchange. The returned ciphertext is the encrypted
    /// initialization payload proving liveness to the peer.
    pub fn create_outbound_session(
        &mut self,
        peer: &IdentityKeys,
        bundle: &PrekeyBundle,
    ) -> Result<(EncryptedData, i64)> {
        let prekey_bytes = decode_b64(&bundle.prekey)?;
        signing::verify_signature(&peer.ed25519, &prekey_bytes, &bundle.prekey_signature)
            .map_err(|_| SessionError::PrekeySignature)?;

        let identity_key = parse_curve25519(&peer.curve25519)?;
        let handshake_key =
            parse_curve25519(bundle.one_time_key.as_deref().unwrap_or(&bundle.prekey))?;

        let mut session = self.accounts.content.account().create_outbound_session(
            SessionConfig::version_2(),
            identity_key,
            handshake_key,
        );

        let version = self
            .content_sessions
            .get(&peer.ed25519)
            .map(|slot| slot.version + 1)
            .unwrap_or(1);

        let message = session.encrypt(INITIAL_ENCRYPTED_MESSAGE.as_bytes());

        self.content_sessions
            .insert(peer.ed25519.clone(), SessionSlot { session, version });

        tracing::debug!(device_id = %peer.ed25519, version, "outbound session created");

        Ok((encode_olm_message(&message, Some(version)), version))
    }

    /// Accept a peer's handshake and derive the inbound session.
    ///
    /// `session_version` is the version the peer declared. A lower
    /// version than the local session means this handshake is stale; an
    /// equal version without `overwrite` means both sides raced and the
    /// caller must tie-break via [`session_race_winner`]. The decrypted
    /// initialization payload is returned as a liveness check; its
    /// content carries no meaning.
    pub fn create_inbound_session(
        &mut self,
        peer: &IdentityKeys,
        initial: &EncryptedData,
        session_version: i64,
        overwrite: bool,
    ) -> Result<String> {
        if let Some(existing) = self.content_sessions.get(&peer.ed25519) {
            if !overwrite && existing.version > session_version {
                return Err(SessionError::SessionAlreadyCreated);
            }
            if !overwrite && existing.version == session_version {
                return Err(SessionError::SessionRaceCondition);
            }
        }

        let OlmMessage::PreKey(prekey_message) = decode_olm_message(initial)? else {
            return Err(SessionError::Malformed(
                "session initialization requires a prekey message".to_string(),
            ));
        };

        let identity_key = parse_curve25519(&peer.curve25519)?;

        let result = self
            .accounts
            .content
            .account_mut()
            .create_inbound_session(identity_key, &prekey_message)
            .map_err(|e| SessionError::Decryption(e.to_string()))?;

        let plaintext = String::from_utf8(result.plaintext)
            .map_err(|e| SessionError::Decryption(e.to_string()))?;

        self.content_sessions.insert(
            peer.ed25519.clone(),
            SessionSlot {
                session: result.session,
                version: session_version,
            },
        );

        tracing::debug!(
            device_id = %peer.ed25519,
            version = session_version,
            "inbound session created"
        );

        Ok(plaintext)
    }
}

fn parse_curve25519(key: &str) -> Result<Curve25519PublicKey> {
    Curve25519PublicKey::from_base64(key).map_err(|e| SessionError::InvalidKey(e.to_string()))
}
