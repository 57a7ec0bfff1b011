use super::*;
use rand::{rngs::StdRng, SeedableRng};

pub fn keys() -> Vec<KeyPair> {
    let mut rng = StdRng::from_seed([0; 32]);
    (0..4).map(|_| KeyPair::generate_keypair(&mut rng)).collect()
}

#[test]
fn verify_valid_signature() {
    // Get a keypair.
    let keypair = keys().pop().unwrap();

    // Make signature.
    let message = b"Hello, world!";
    let signature = keypair.sign(message);

    // Verify the signature.
    assert!(keypair.public().verify(message, &signature).is_ok());
}

#[test]
fn verify_invalid_signature() {
    // Get a keypair.
    let keypair = keys().pop().unwrap();

    // Make signature.
    let signature = keypair.sign(b"Hello, world!");

    // Verify the signature against a different message.
    assert!(keypair.public().verify(b"Bad message!", &signature).is_err());
}

#[test]
fn ecdsa_signature_decimal_round_trip() {
    let keypair = keys().pop().unwrap();
    let signature = keypair.sign(b"Hello, world!");

    let rebuilt =
        EcdsaSignature::from_decimals(&signature.r_decimal(), &signature.s_decimal()).unwrap();
    assert!(keypair.public().verify(b"Hello, world!", &rebuilt).is_ok());
}

#[test]
fn ecdsa_public_key_decimal_round_trip() {
    let keypair = keys().pop().unwrap();
    let public = keypair.public();

    let rebuilt =
        EcdsaPublicKey::from_decimals(&public.x_decimal(), &public.y_decimal()).unwrap();
    assert_eq!(public, rebuilt);
    assert_eq!(public.node_id(), rebuilt.node_id());
}

#[test]
fn node_id_is_ten_decimal_chars() {
    for keypair in keys() {
        let id = keypair.node_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }
}

#[test]
fn verify_valid_aggregate() {
    // Sign three distinct messages with the same key.
    let keypair = keys().pop().unwrap();
    let messages: Vec<Vec<u8>> = (0..3).map(|i| format!("message {}", i).into_bytes()).collect();
    let signatures: Vec<_> = messages.iter().map(|m| keypair.bls_sign(m)).collect();

    // Aggregate and verify with repeated public keys.
    let aggregate = BlsSignature::aggregate(&signatures).unwrap();
    let public = keypair.bls_public();
    let key_refs: Vec<_> = messages.iter().map(|_| &public).collect();
    let message_refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
    assert!(BlsPublicKey::verify_aggregate(&key_refs, &message_refs, &aggregate).is_ok());
}

#[test]
fn verify_invalid_aggregate() {
    // Aggregate signatures where one covers a different message.
    let keypair = keys().pop().unwrap();
    let messages: Vec<Vec<u8>> = (0..3).map(|i| format!("message {}", i).into_bytes()).collect();
    let mut signatures: Vec<_> = messages.iter().map(|m| keypair.bls_sign(m)).collect();
    signatures[2] = keypair.bls_sign(b"tampered");

    let aggregate = BlsSignature::aggregate(&signatures).unwrap();
    let public = keypair.bls_public();
    let key_refs: Vec<_> = messages.iter().map(|_| &public).collect();
    let message_refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
    assert!(BlsPublicKey::verify_aggregate(&key_refs, &message_refs, &aggregate).is_err());
}

#[test]
fn single_signature_aggregates_to_itself() {
    let keypair = keys().pop().unwrap();
    let signature = keypair.bls_sign(b"only one");

    let aggregate = BlsSignature::aggregate(&[signature.clone()]).unwrap();
    assert_eq!(aggregate, signature);
    assert!(keypair.bls_public().verify(b"only one", &aggregate).is_ok());
}

#[test]
fn bls_key_base64_round_trip() {
    let keypair = keys().pop().unwrap();
    let public = keypair.bls_public();

    let rebuilt = BlsPublicKey::decode_base64(&public.encode_base64()).unwrap();
    assert_eq!(public, rebuilt);
}

#[test]
fn keypair_serde_round_trip() {
    let keypair = keys().pop().unwrap();
    let serialized = serde_json::to_string(&keypair).unwrap();
    let rebuilt: KeyPair = serde_json::from_str(&serialized).unwrap();

    assert_eq!(keypair.public(), rebuilt.public());
    assert_eq!(keypair.bls_public(), rebuilt.bls_public());

    // The restored key signs messages the original public key accepts.
    let signature = rebuilt.sign(b"round trip");
    assert!(keypair.public().verify(b"round trip", &signature).is_ok());
}

#[test]
fn merkle_root_is_stable_and_order_sensitive() {
    let leaves: Vec<String> = (0..5).map(|i| format!("{}", i * 1000)).collect();
    let root = merkle_root(&leaves);
    assert_eq!(root, merkle_root(&leaves));
    assert_eq!(root.len(), 64);

    let mut reversed = leaves.clone();
    reversed.reverse();
    assert_ne!(root, merkle_root(&reversed));
}

#[test]
fn merkle_root_single_leaf() {
    let leaves = vec!["12345".to_string()];
    assert_eq!(merkle_root(&leaves), hex::encode(sha256(b"12345").0));
}
