//! Property-based tests for the self-ratchet and channel crypto
//!
//! These tests verify the invariants the ledger relies on:
//!
//! 1. **Determinism**: replaying a lineage from the same seed reproduces the
//!    same (key id, key) sequence
//! 2. **Key uniqueness**: a lineage never repeats a key identifier
//! 3. **Direction agreement**: both channel endpoints derive mirrored seeds
//! 4. **Round-trip**: decrypt(encrypt(m)) == m under any emitted key

use keyloom_crypto::{
    AuthenticatedEncryption, RatchetSeed, SeededPrng, SharedSecret, SuiteVersion,
    XChaCha20Poly1305Aead, derive_epoch_seeds, ratchet_step,
};
use proptest::prelude::*;

fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::collection::vec(any::<u8>(), 32..=32).prop_map(|v| {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&v);
        arr
    })
}

fn lineage(seed: [u8; 32], count: usize) -> Vec<([u8; 32], [u8; 32])> {
    let mut current = RatchetSeed::from_bytes(seed);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let step = ratchet_step(&current, SuiteVersion::V1);
        out.push((*step.key_id.as_bytes(), *step.key.as_bytes()));
        current = step.next_seed;
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_lineage_is_deterministic(seed in seed_strategy(), count in 1usize..40) {
        prop_assert_eq!(lineage(seed, count), lineage(seed, count));
    }

    #[test]
    fn prop_lineage_key_ids_unique(seed in seed_strategy(), count in 2usize..40) {
        let keys = lineage(seed, count);
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                prop_assert_ne!(keys[i].0, keys[j].0, "key ids {} and {} collide", i, j);
            }
        }
    }

    #[test]
    fn prop_endpoints_mirror_seeds(
        secret in seed_strategy(),
        count in any::<u64>(),
        local in prop::collection::vec(any::<u8>(), 1..64),
        remote in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        prop_assume!(local != remote);
        let shared = SharedSecret::from_bytes(secret);

        let a = derive_epoch_seeds(&shared, count, &local, &remote, SuiteVersion::V1);
        let b = derive_epoch_seeds(&shared, count, &remote, &local, SuiteVersion::V1);

        prop_assert_eq!(a.send, b.receive);
        prop_assert_eq!(a.receive, b.send);
    }

    #[test]
    fn prop_emitted_keys_roundtrip(
        seed in seed_strategy(),
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        nonce_seed in any::<u64>(),
    ) {
        let step = ratchet_step(&RatchetSeed::from_bytes(seed), SuiteVersion::V1);
        let mut prng = SeededPrng::from_u64(nonce_seed);

        let sealed =
            XChaCha20Poly1305Aead.encrypt(step.key.as_bytes(), &plaintext, &mut prng).unwrap();
        let opened = XChaCha20Poly1305Aead.decrypt(step.key.as_bytes(), &sealed).unwrap();

        prop_assert_eq!(opened, plaintext);
    }
}
