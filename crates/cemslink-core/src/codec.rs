//! Envelope construction, encryption and request signing.
//!
//! The wire format is fixed by the receiving validator:
//!
//! - Body: compact JSON
//!   `{"data":[{"stationId":S,"device_data":[{"deviceId":D,"params":[…]}]}]}`,
//!   encrypted with AES-256 in ECB mode (PKCS#7 padding) under
//!   `SHA-256(shared_secret)`, then base64-encoded and sent as `text/plain`.
//! - `signature` header: base64 of RSA-OAEP(SHA-256) over
//!   `"{shared_secret}$*{wall clock, microseconds}"` with the receiver's
//!   public key. Recomputed for every attempt.
//!
//! **ECB is used only because the receiver demands it.** It leaks equality
//! of plaintext blocks and offers no integrity. Do not copy this construction
//! into anything that is free to choose its own cipher mode.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand_core::{CryptoRngCore, OsRng};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregator::AveragedSet;
use crate::error::{CodecError, TimestampError};
use crate::schedule::is_aligned;

type Aes256EcbEnc = ecb::Encryptor<Aes256>;
type Aes256EcbDec = ecb::Decryptor<Aes256>;

/// Flag attached to every parameter; the receiver only accepts `"U"`.
pub const PARAM_FLAG: &str = "U";

/// Receivers refuse readings older than this.
pub const BACKDATE_LIMIT_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Signature timestamp layout (`2026-01-01 05:30:00.123456`).
pub const SIGNATURE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Separator between the shared secret and the timestamp in a signature.
pub const SIGNATURE_SEPARATOR: &str = "$*";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One averaged parameter as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeParam {
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: i64,
    pub flag: String,
}

/// Plaintext payload for one station, one device, one aligned instant.
///
/// The single-station shape is enforced by construction: there is no way to
/// build or decode an envelope carrying more than one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub station_id: String,
    pub device_id: String,
    /// Aligned dispatch instant, Unix milliseconds.
    pub timestamp_ms: i64,
    pub params: Vec<EnvelopeParam>,
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    data: Vec<WireStation>,
}

#[derive(Serialize, Deserialize)]
struct WireStation {
    #[serde(rename = "stationId")]
    station_id: String,
    device_data: Vec<WireDevice>,
}

#[derive(Serialize, Deserialize)]
struct WireDevice {
    #[serde(rename = "deviceId")]
    device_id: String,
    params: Vec<EnvelopeParam>,
}

/// Build the envelope for one flushed window.
pub fn build_envelope(
    device_id: &str,
    station_id: &str,
    averaged: &AveragedSet,
    timestamp: DateTime<Utc>,
) -> Result<DispatchEnvelope, CodecError> {
    if averaged.is_empty() {
        return Err(CodecError::EmptyEnvelope);
    }
    if station_id.trim().is_empty() {
        return Err(CodecError::StationCount(0));
    }
    if device_id.trim().is_empty() {
        return Err(CodecError::DeviceCount(0));
    }

    let ts = timestamp.timestamp_millis();
    let params = averaged
        .iter()
        .map(|(parameter, avg)| EnvelopeParam {
            parameter: parameter.clone(),
            value: avg.value,
            unit: avg.unit.clone(),
            timestamp: ts,
            flag: PARAM_FLAG.to_string(),
        })
        .collect();

    Ok(DispatchEnvelope {
        station_id: station_id.to_string(),
        device_id: device_id.to_string(),
        timestamp_ms: ts,
        params,
    })
}

impl DispatchEnvelope {
    /// Compact JSON exactly as it is encrypted.
    pub fn to_canonical_json(&self) -> Result<String, CodecError> {
        let wire = WirePayload {
            data: vec![WireStation {
                station_id: self.station_id.clone(),
                device_data: vec![WireDevice {
                    device_id: self.device_id.clone(),
                    params: self.params.clone(),
                }],
            }],
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse the canonical JSON form back into an envelope.
    pub fn from_canonical_json(json: &str) -> Result<Self, CodecError> {
        let wire: WirePayload =
            serde_json::from_str(json).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let mut stations = wire.data;
        if stations.len() != 1 {
            return Err(CodecError::StationCount(stations.len()));
        }
        let station = stations.remove(0);
        let mut devices = station.device_data;
        if devices.len() != 1 {
            return Err(CodecError::DeviceCount(devices.len()));
        }
        let device = devices.remove(0);
        let Some(first) = device.params.first() else {
            return Err(CodecError::EmptyEnvelope);
        };
        let timestamp_ms = first.timestamp;

        Ok(Self {
            station_id: station.station_id,
            device_id: device.device_id,
            timestamp_ms,
            params: device.params,
        })
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

// ---------------------------------------------------------------------------
// Symmetric layer
// ---------------------------------------------------------------------------

/// AES-256 key: SHA-256 of the shared secret.
pub fn derive_key(shared_secret: &str) -> [u8; 32] {
    Sha256::digest(shared_secret.as_bytes()).into()
}

/// Encrypt arbitrary text the way envelope bodies are encrypted.
pub fn encrypt_text(plaintext: &str, shared_secret: &str) -> String {
    let key = derive_key(shared_secret);
    let ciphertext =
        Aes256EcbEnc::new(&key.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    BASE64.encode(ciphertext)
}

/// Reverse of [`encrypt_text`].
pub fn decrypt_text(body: &str, shared_secret: &str) -> Result<String, CodecError> {
    let ciphertext = BASE64.decode(body.trim())?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CodecError::Decrypt);
    }
    let key = derive_key(shared_secret);
    let plaintext = Aes256EcbDec::new(&key.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CodecError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CodecError::Utf8)
}

/// Serialize and encrypt an envelope; returns the base64 request body.
pub fn encrypt_envelope(
    envelope: &DispatchEnvelope,
    shared_secret: &str,
) -> Result<String, CodecError> {
    Ok(encrypt_text(&envelope.to_canonical_json()?, shared_secret))
}

/// Decrypt a request body and parse the envelope inside it.
pub fn decrypt_envelope(body: &str, shared_secret: &str) -> Result<DispatchEnvelope, CodecError> {
    DispatchEnvelope::from_canonical_json(&decrypt_text(body, shared_secret)?)
}

// ---------------------------------------------------------------------------
// Signature layer
// ---------------------------------------------------------------------------

/// Parse a PEM public key (SPKI or PKCS#1). Escaped `\n` sequences, as found
/// in single-line environment variables, are accepted.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CodecError> {
    let pem = pem.replace("\\n", "\n");
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CodecError::PublicKey(e.to_string()))
}

/// Parse a PEM private key (PKCS#8 or PKCS#1).
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, CodecError> {
    let pem = pem.replace("\\n", "\n");
    let pem = pem.trim();
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| CodecError::PrivateKey(e.to_string()))
}

/// The plaintext that gets encrypted into a signature.
pub fn signature_message(shared_secret: &str, at: DateTime<Tz>) -> String {
    format!(
        "{shared_secret}{SIGNATURE_SEPARATOR}{}",
        at.format(SIGNATURE_TIME_FORMAT)
    )
}

/// Compute the `signature` header for an attempt made at `at`.
pub fn sign<R: CryptoRngCore>(
    shared_secret: &str,
    at: DateTime<Tz>,
    public_key: &RsaPublicKey,
    rng: &mut R,
) -> Result<String, CodecError> {
    let message = signature_message(shared_secret, at);
    let encrypted = public_key.encrypt(rng, Oaep::new::<Sha256>(), message.as_bytes())?;
    Ok(BASE64.encode(encrypted))
}

/// Recover the signed message with the receiver's private key.
pub fn open_signature(signature: &str, private_key: &RsaPrivateKey) -> Result<String, CodecError> {
    let encrypted = BASE64.decode(signature.trim())?;
    let message = private_key.decrypt(Oaep::new::<Sha256>(), &encrypted)?;
    String::from_utf8(message).map_err(|_| CodecError::Utf8)
}

// ---------------------------------------------------------------------------
// Timestamp rules
// ---------------------------------------------------------------------------

/// True if a reading captured at `captured_ms` is past the backdate limit.
pub fn is_backdated(captured_ms: i64, now: DateTime<Utc>) -> bool {
    now.timestamp_millis() - captured_ms > BACKDATE_LIMIT_MS
}

/// Apply the receiver's timestamp rules to `ts_ms`.
pub fn validate_timestamp(
    ts_ms: i64,
    now: DateTime<Utc>,
    granularity_minutes: u32,
    tz: &Tz,
) -> Result<(), TimestampError> {
    if is_backdated(ts_ms, now) {
        return Err(TimestampError::Backdated);
    }
    if ts_ms > now.timestamp_millis() {
        return Err(TimestampError::Future);
    }
    let aligned = DateTime::from_timestamp_millis(ts_ms)
        .is_some_and(|ts| is_aligned(ts, granularity_minutes, tz));
    if !aligned {
        return Err(TimestampError::Misaligned(granularity_minutes));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// A sealed request body plus headers for one send attempt.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    body: String,
    signature: String,
    device_id: String,
}

impl EncryptedPayload {
    /// Base64 ciphertext, sent as the request body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Value of the `signature` header.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Value of the `X-Device-Id` header.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Device credentials bound to the envelope and signature functions.
pub struct PayloadCodec {
    device_id: String,
    station_id: String,
    shared_secret: String,
    public_key: RsaPublicKey,
    tz: Tz,
}

impl PayloadCodec {
    pub fn new(
        device_id: impl Into<String>,
        station_id: impl Into<String>,
        shared_secret: impl Into<String>,
        public_key: RsaPublicKey,
        tz: Tz,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            station_id: station_id.into(),
            shared_secret: shared_secret.into(),
            public_key,
            tz,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Build this device's envelope for one window.
    pub fn build(
        &self,
        averaged: &AveragedSet,
        timestamp: DateTime<Utc>,
    ) -> Result<DispatchEnvelope, CodecError> {
        build_envelope(&self.device_id, &self.station_id, averaged, timestamp)
    }

    /// Encrypt `envelope` and sign for an attempt at `now`.
    pub fn seal(
        &self,
        envelope: &DispatchEnvelope,
        now: DateTime<Utc>,
    ) -> Result<EncryptedPayload, CodecError> {
        self.seal_with_rng(envelope, now, &mut OsRng)
    }

    pub fn seal_with_rng<R: CryptoRngCore>(
        &self,
        envelope: &DispatchEnvelope,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<EncryptedPayload, CodecError> {
        let body = encrypt_envelope(envelope, &self.shared_secret)?;
        let signature = sign(
            &self.shared_secret,
            now.with_timezone(&self.tz),
            &self.public_key,
            rng,
        )?;
        Ok(EncryptedPayload {
            body,
            signature,
            device_id: envelope.device_id.clone(),
        })
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("device_id", &self.device_id)
            .field("station_id", &self.station_id)
            .field("tz", &self.tz)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AveragedValue;

    const SECRET: &str = "Hvg_LrxeePXexh7TM76jQqWsWGRV4M4gvX1_tvKDMN4=";
    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/receiver_private.pem");
    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/receiver_public.pem");

    // Independently computed: openssl enc -aes-256-ecb -K sha256(SECRET).
    const KAT_PLAINTEXT: &str = r#"{"data":[{"stationId":"station_8203","device_data":[{"deviceId":"device_7025","params":[{"parameter":"ph","value":8.2,"unit":"pH","timestamp":1767225600000,"flag":"U"}]}]}]}"#;
    const KAT_CIPHERTEXT: &str = "efN7G1ZUqYRKWP0/F7aSCAaawHRaUjB1yaS4ctIzmCiPkt0J3yS9WHcLnwLO9AZ9/V1Oh2HQA649ZDTuurgrcQ5/UHqNhnqu/t6DF/W2v1uA9pd26+Goucv8xBy/qvsWt1M4IxAG1ABHFd2Fc7ZZryQyLQ3H/OR0XKeU2YXNIQh5NJUOVeoLOzwCKHpmbMQDqVBnCnArGBQtY5vkiYMnUMpDklgahnLJmxtLAZLovG4=";

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_767_225_600_000).unwrap()
    }

    fn ph_set() -> AveragedSet {
        let mut set = AveragedSet::new();
        set.insert(
            "ph",
            AveragedValue {
                value: 8.2,
                unit: "pH".into(),
                samples: 4,
            },
        );
        set
    }

    fn codec() -> PayloadCodec {
        PayloadCodec::new(
            "device_7025",
            "station_8203",
            SECRET,
            parse_public_key(PUBLIC_PEM).unwrap(),
            chrono_tz::Asia::Kolkata,
        )
    }

    #[test]
    fn test_derive_key_is_sha256_of_secret() {
        let key = derive_key(SECRET);
        let hex: String = key.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(
            hex,
            "d5bf22f9c5a39f5ea331528a640cd774d99c8bc3865fbc9c759846e4a36079dc"
        );
    }

    #[test]
    fn test_canonical_json_matches_wire_layout() {
        let env = build_envelope("device_7025", "station_8203", &ph_set(), ts()).unwrap();
        assert_eq!(env.to_canonical_json().unwrap(), KAT_PLAINTEXT);
    }

    // Known-answer test pinning the receiver's ECB construction. ECB is kept
    // for wire compatibility only and must not be reused elsewhere.
    #[test]
    fn test_known_answer_ciphertext() {
        let env = build_envelope("device_7025", "station_8203", &ph_set(), ts()).unwrap();
        assert_eq!(encrypt_envelope(&env, SECRET).unwrap(), KAT_CIPHERTEXT);
        assert_eq!(decrypt_text(KAT_CIPHERTEXT, SECRET).unwrap(), KAT_PLAINTEXT);
    }

    #[test]
    fn test_ciphertext_is_deterministic() {
        let env = build_envelope("d", "s", &ph_set(), ts()).unwrap();
        let a = encrypt_envelope(&env, SECRET).unwrap();
        let b = encrypt_envelope(&env, SECRET).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut set = ph_set();
        set.insert(
            "pm10",
            AveragedValue {
                value: -12.5,
                unit: "µg/m3".into(),
                samples: 1,
            },
        );
        let env = build_envelope("dev", "stn", &set, ts()).unwrap();
        let body = encrypt_envelope(&env, SECRET).unwrap();
        assert_eq!(decrypt_envelope(&body, SECRET).unwrap(), env);
    }

    #[test]
    fn test_wrong_secret_fails_to_decrypt() {
        let env = build_envelope("dev", "stn", &ph_set(), ts()).unwrap();
        let body = encrypt_envelope(&env, SECRET).unwrap();
        assert!(decrypt_envelope(&body, "another-secret").is_err());
    }

    #[test]
    fn test_empty_set_is_rejected() {
        let err = build_envelope("dev", "stn", &AveragedSet::new(), ts()).unwrap_err();
        assert!(matches!(err, CodecError::EmptyEnvelope));
    }

    #[test]
    fn test_blank_station_is_rejected() {
        let err = build_envelope("dev", " ", &ph_set(), ts()).unwrap_err();
        assert!(matches!(err, CodecError::StationCount(0)));
    }

    #[test]
    fn test_decode_rejects_multiple_stations() {
        let json = r#"{"data":[
            {"stationId":"a","device_data":[{"deviceId":"d","params":[{"parameter":"p","value":1.0,"unit":"u","timestamp":0,"flag":"U"}]}]},
            {"stationId":"b","device_data":[{"deviceId":"d","params":[{"parameter":"p","value":1.0,"unit":"u","timestamp":0,"flag":"U"}]}]}
        ]}"#;
        let err = DispatchEnvelope::from_canonical_json(json).unwrap_err();
        assert!(matches!(err, CodecError::StationCount(2)));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let json = r#"{"data":[{"stationId":"a","device_data":[{"deviceId":"d","params":[{"parameter":"p","value":1.0}]}]}]}"#;
        let err = DispatchEnvelope::from_canonical_json(json).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_signature_opens_with_private_key() {
        let public_key = parse_public_key(PUBLIC_PEM).unwrap();
        let private_key = parse_private_key(PRIVATE_PEM).unwrap();
        let at = ts().with_timezone(&chrono_tz::Asia::Kolkata);
        let sig = sign(SECRET, at, &public_key, &mut OsRng).unwrap();
        let message = open_signature(&sig, &private_key).unwrap();
        assert_eq!(message, format!("{SECRET}$*2026-01-01 05:30:00.000000"));
    }

    #[test]
    fn test_each_seal_gets_a_fresh_signature() {
        let codec = codec();
        let env = codec.build(&ph_set(), ts()).unwrap();
        let a = codec.seal(&env, ts()).unwrap();
        let b = codec.seal(&env, ts()).unwrap();
        // Same body, randomized OAEP signature.
        assert_eq!(a.body(), b.body());
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.device_id(), "device_7025");
    }

    #[test]
    fn test_public_key_with_escaped_newlines() {
        let escaped = PUBLIC_PEM.trim().replace('\n', "\\n");
        assert!(parse_public_key(&escaped).is_ok());
        assert!(parse_public_key("not a key").is_err());
    }

    #[test]
    fn test_validate_timestamp_rules() {
        let tz = chrono_tz::Asia::Kolkata;
        let now = ts() + chrono::Duration::minutes(3);
        let aligned = ts().timestamp_millis();
        assert_eq!(validate_timestamp(aligned, now, 15, &tz), Ok(()));
        assert_eq!(
            validate_timestamp(aligned + 60_000, now, 15, &tz),
            Err(TimestampError::Misaligned(15))
        );
        assert_eq!(validate_timestamp(aligned + 60_000, now, 1, &tz), Ok(()));
        assert_eq!(
            validate_timestamp(aligned + 15 * 60_000, now, 15, &tz),
            Err(TimestampError::Future)
        );
        let old = aligned - BACKDATE_LIMIT_MS - 15 * 60_000;
        assert_eq!(
            validate_timestamp(old, now, 15, &tz),
            Err(TimestampError::Backdated)
        );
    }
}
