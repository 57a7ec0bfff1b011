use blst::min_pk as bls;
use blst::BLST_ERROR;
use num_bigint::BigUint;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as P256Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::array::TryFromSliceError;
use std::convert::TryFrom;
use thiserror::Error;

#[cfg(test)]
#[path = "tests/crypto_tests.rs"]
pub mod crypto_tests;

/// Domain separation tag of the BLS12-381 G2 proof-of-possession scheme.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// The short textual identity of a node, derived from its ECDSA public key.
pub type NodeId = String;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid public key encoding: {0}")]
    InvalidKey(String),

    #[error("Invalid decimal field element '{0}'")]
    InvalidFieldElement(String),

    #[error("BLS operation failed with {0:?}")]
    Bls(BLST_ERROR),
}

/// Represents a hash digest (32 bytes).
#[derive(Hash, PartialEq, Default, Eq, Clone, Deserialize, Serialize, Ord, PartialOrd)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Convert a digest into a vector of bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Return the number of bytes of a digest.
    pub fn size(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", base64::encode(&self.0))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", base64::encode(&self.0).get(0..16).unwrap_or_default())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = TryFromSliceError;
    fn try_from(item: &[u8]) -> Result<Self, Self::Error> {
        Ok(Digest(item.try_into()?))
    }
}

/// Hash arbitrary bytes with SHA-256.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// A stable 64-bit hash: the first 8 big-endian bytes of the SHA-256 digest.
pub fn stable_hash(data: &[u8]) -> u64 {
    let digest = sha256(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(prefix)
}

/// The decimal-string rendering of the stable 64-bit hash.
pub fn decimal_hash(data: &[u8]) -> String {
    stable_hash(data).to_string()
}

fn bytes_to_decimal(bytes: &[u8]) -> String {
    BigUint::from_bytes_be(bytes).to_str_radix(10)
}

fn decimal_to_field_bytes(s: &str) -> Result<FieldBytes, CryptoError> {
    let value = BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| CryptoError::InvalidFieldElement(s.to_string()))?;
    let raw = value.to_bytes_be();
    if raw.len() > 32 {
        return Err(CryptoError::InvalidFieldElement(s.to_string()));
    }
    let mut padded = [0u8; 32];
    padded[32 - raw.len()..].copy_from_slice(&raw);
    Ok(FieldBytes::clone_from_slice(&padded))
}

/// A P-256 ECDSA public key, carried on the wire as its affine coordinates
/// rendered as decimal strings `[x, y]`.
#[derive(Clone)]
pub struct EcdsaPublicKey(VerifyingKey);

impl EcdsaPublicKey {
    /// The x coordinate as a decimal string.
    pub fn x_decimal(&self) -> String {
        let point = self.0.to_encoded_point(false);
        bytes_to_decimal(point.x().map(|x| x.as_slice()).unwrap_or_default())
    }

    /// The y coordinate as a decimal string.
    pub fn y_decimal(&self) -> String {
        let point = self.0.to_encoded_point(false);
        bytes_to_decimal(point.y().map(|y| y.as_slice()).unwrap_or_default())
    }

    /// Rebuild a key from its decimal coordinates.
    pub fn from_decimals(x: &str, y: &str) -> Result<Self, CryptoError> {
        let x = decimal_to_field_bytes(x)?;
        let y = decimal_to_field_bytes(y)?;
        let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
        let key = VerifyingKey::from_encoded_point(&point)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(key))
    }

    /// The stable 10-character node identity bound to this key: the decimal
    /// prefix of the hash over the canonical `[x, y]` encoding.
    pub fn node_id(&self) -> NodeId {
        let encoded = serde_json::to_vec(self).expect("Failed to serialize public key");
        let mut id = format!("{:020}", stable_hash(&encoded));
        id.truncate(10);
        id
    }

    /// Verify an ECDSA signature over a message.
    pub fn verify(&self, message: &[u8], signature: &EcdsaSignature) -> Result<(), CryptoError> {
        self.0
            .verify(message, &signature.0)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}

impl Serialize for EcdsaPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        [self.x_decimal(), self.y_decimal()].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EcdsaPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let [x, y] = <[String; 2]>::deserialize(deserializer)?;
        Self::from_decimals(&x, &y).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

impl PartialEq for EcdsaPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_encoded_point(false) == other.0.to_encoded_point(false)
    }
}

impl Eq for EcdsaPublicKey {}

impl std::fmt::Debug for EcdsaPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.node_id())
    }
}

impl std::fmt::Display for EcdsaPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.node_id())
    }
}

/// An ECDSA signature, carried on the wire as `[r, s]` decimal strings.
#[derive(Clone)]
pub struct EcdsaSignature(P256Signature);

impl EcdsaSignature {
    pub fn r_decimal(&self) -> String {
        let (r, _) = self.0.split_bytes();
        bytes_to_decimal(r.as_slice())
    }

    pub fn s_decimal(&self) -> String {
        let (_, s) = self.0.split_bytes();
        bytes_to_decimal(s.as_slice())
    }

    pub fn from_decimals(r: &str, s: &str) -> Result<Self, CryptoError> {
        let r = decimal_to_field_bytes(r)?;
        let s = decimal_to_field_bytes(s)?;
        let signature = P256Signature::from_scalars(r, s)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(Self(signature))
    }
}

impl Serialize for EcdsaSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        [self.r_decimal(), self.s_decimal()].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EcdsaSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let [r, s] = <[String; 2]>::deserialize(deserializer)?;
        Self::from_decimals(&r, &s).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

impl std::fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "sig({}..)", self.r_decimal().get(0..8).unwrap_or_default())
    }
}

/// A BLS12-381 public key (compressed G1), base64 on the wire.
#[derive(Clone)]
pub struct BlsPublicKey(bls::PublicKey);

impl BlsPublicKey {
    /// Encode a public key in base64 (human-readable).
    pub fn encode_base64(&self) -> String {
        base64::encode(self.0.to_bytes())
    }

    /// Decode a base64-encoded public key.
    pub fn decode_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::decode(s).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key = bls::PublicKey::from_bytes(&bytes).map_err(CryptoError::Bls)?;
        Ok(Self(key))
    }

    /// Verify an aggregate signature over `messages`, one public key per
    /// message (repeated keys are the common case here).
    pub fn verify_aggregate(
        keys: &[&BlsPublicKey],
        messages: &[&[u8]],
        signature: &BlsSignature,
    ) -> Result<(), CryptoError> {
        let raw: Vec<&bls::PublicKey> = keys.iter().map(|k| &k.0).collect();
        match signature.0.aggregate_verify(true, messages, BLS_DST, &raw, true) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            e => Err(CryptoError::Bls(e)),
        }
    }

    /// Verify a single signature.
    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> Result<(), CryptoError> {
        match signature.0.verify(true, message, BLS_DST, &[], &self.0, true) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            e => Err(CryptoError::Bls(e)),
        }
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.encode_base64())
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::decode_base64(&s).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes() == other.0.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.encode_base64().get(0..16).unwrap_or_default())
    }
}

/// A BLS12-381 signature (compressed G2), base64 on the wire.
#[derive(Clone)]
pub struct BlsSignature(bls::Signature);

impl BlsSignature {
    pub fn encode_base64(&self) -> String {
        base64::encode(self.0.to_bytes())
    }

    pub fn decode_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::decode(s).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let signature = bls::Signature::from_bytes(&bytes).map_err(CryptoError::Bls)?;
        Ok(Self(signature))
    }

    /// Aggregate many signatures into one. A single signature aggregates to
    /// itself.
    pub fn aggregate(signatures: &[BlsSignature]) -> Result<BlsSignature, CryptoError> {
        let raw: Vec<&bls::Signature> = signatures.iter().map(|s| &s.0).collect();
        let aggregate = bls::AggregateSignature::aggregate(&raw, true).map_err(CryptoError::Bls)?;
        Ok(BlsSignature(aggregate.to_signature()))
    }
}

impl Serialize for BlsSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.encode_base64())
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::decode_base64(&s).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes()[..] == other.0.to_bytes()[..]
    }
}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.encode_base64().get(0..16).unwrap_or_default())
    }
}

/// The long-term key material of a node: one ECDSA/P-256 keypair and one
/// BLS12-381 keypair.
pub struct KeyPair {
    ecdsa: SigningKey,
    bls: bls::SecretKey,
}

impl KeyPair {
    /// Generate a new keypair.
    pub fn generate_production_keypair() -> KeyPair {
        Self::generate_keypair(&mut OsRng)
    }

    /// Generate a keypair from the specified RNG (useful for testing).
    pub fn generate_keypair<R>(csprng: &mut R) -> KeyPair
    where
        R: CryptoRng + RngCore,
    {
        let ecdsa = SigningKey::random(csprng);
        let mut ikm = [0u8; 32];
        csprng.fill_bytes(&mut ikm);
        let bls = bls::SecretKey::key_gen(&ikm, &[]).expect("Failed to generate BLS key");
        Self { ecdsa, bls }
    }

    /// Returns the ECDSA public key part of the keypair.
    pub fn public(&self) -> EcdsaPublicKey {
        EcdsaPublicKey(*self.ecdsa.verifying_key())
    }

    /// Returns the BLS public key part of the keypair.
    pub fn bls_public(&self) -> BlsPublicKey {
        BlsPublicKey(self.bls.sk_to_pk())
    }

    /// The node identity derived from the ECDSA public key.
    pub fn node_id(&self) -> NodeId {
        self.public().node_id()
    }

    /// Sign a message with the ECDSA key.
    pub fn sign(&self, message: &[u8]) -> EcdsaSignature {
        EcdsaSignature(self.ecdsa.sign(message))
    }

    /// Sign a message with the BLS key.
    pub fn bls_sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.bls.sign(message, BLS_DST, &[]))
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            ecdsa: self.ecdsa.clone(),
            bls: self.bls.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KeyPairData {
    ecdsa: String,
    bls: String,
}

impl Serialize for KeyPair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        KeyPairData {
            ecdsa: base64::encode(self.ecdsa.to_bytes()),
            bls: base64::encode(self.bls.to_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D>(deserializer: D) -> Result<KeyPair, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let data = KeyPairData::deserialize(deserializer)?;
        let ecdsa_bytes =
            base64::decode(&data.ecdsa).map_err(|e| serde::de::Error::custom(e.to_string()))?;
        let ecdsa = SigningKey::from_bytes(FieldBytes::from_slice(&ecdsa_bytes))
            .map_err(|e| serde::de::Error::custom(e.to_string()))?;
        let bls_bytes =
            base64::decode(&data.bls).map_err(|e| serde::de::Error::custom(e.to_string()))?;
        let bls = bls::SecretKey::from_bytes(&bls_bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(KeyPair { ecdsa, bls })
    }
}

/// The hex root of a binary merkle tree whose leaves are the given strings.
/// Odd levels duplicate their last node.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return hex::encode(sha256(&[]).0);
    }
    let mut level: Vec<Digest> = leaves.iter().map(|leaf| sha256(leaf.as_bytes())).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level.last().expect("Merkle level is non-empty").clone();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(&pair[0].0);
                hasher.update(&pair[1].0);
                Digest(hasher.finalize().into())
            })
            .collect();
    }
    hex::encode(&level[0].0)
}
