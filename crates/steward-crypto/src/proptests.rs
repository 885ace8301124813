#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::secret::SharedSecret;
    use crate::verify::verify_detached;
    use ed25519_dalek::{Signer, SigningKey};

    proptest! {
        #[test]
        fn test_signature_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let sign_key = SigningKey::from_bytes(&seed);
            let verify_key = sign_key.verifying_key();

            let sig = sign_key.sign(&message).to_bytes();
            prop_assert!(verify_detached(&verify_key, &message, &sig));
        }

        #[test]
        fn test_signature_rejects_other_message(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>(),
            other in any::<Vec<u8>>()
        ) {
            prop_assume!(message != other);

            let sign_key = SigningKey::from_bytes(&seed);
            let verify_key = sign_key.verifying_key();

            let sig = sign_key.sign(&message).to_bytes();
            prop_assert!(!verify_detached(&verify_key, &other, &sig));
        }

        #[test]
        fn test_signature_rejects_bit_flip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>(),
            byte in 0usize..64,
            bit in 0u8..8
        ) {
            let sign_key = SigningKey::from_bytes(&seed);
            let verify_key = sign_key.verifying_key();

            let mut sig = sign_key.sign(&message).to_bytes();
            sig[byte] ^= 1 << bit;
            prop_assert!(!verify_detached(&verify_key, &message, &sig));
        }

        #[test]
        fn test_degraded_tag_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let secret = SharedSecret::from_seed(seed);
            let tag = secret.tag(&message);
            prop_assert!(secret.verify(&message, &tag));
        }

        #[test]
        fn test_degraded_tag_rejects_bit_flip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>(),
            byte in 0usize..32,
            bit in 0u8..8
        ) {
            let secret = SharedSecret::from_seed(seed);
            let mut tag = secret.tag(&message);
            tag[byte] ^= 1 << bit;
            prop_assert!(!secret.verify(&message, &tag));
        }
    }
}
