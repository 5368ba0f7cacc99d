use keyward_protocol::{reconstruct, split, KeyIdentity, KeywardError, ProtocolError};
use proptest::prelude::*;

fn creator() -> keyward_protocol::Identity {
    KeyIdentity::from_seed([7; 32]).identity()
}

/// Valid (threshold, total) pairs with 1 <= t <= n <= 10.
fn threshold_and_total() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=10).prop_flat_map(|n| (1usize..=n, Just(n)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any `threshold` distinct shares reconstruct the secret.
    #[test]
    fn any_threshold_subset_reconstructs(
        secret in prop::collection::vec(any::<u8>(), 0..200),
        (t, n) in threshold_and_total(),
        seed in any::<u64>(),
    ) {
        let shards = split(&secret, t, n, creator(), 1).expect("split");
        prop_assert_eq!(shards.len(), n);

        // Deterministic pseudo-random subset of size t.
        let mut order: Vec<usize> = (0..n).collect();
        let mut state = seed;
        for i in (1..n).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state >> 33) as usize % (i + 1));
        }
        let subset: Vec<_> = order[..t].iter().map(|&i| shards[i].clone()).collect();
        prop_assert_eq!(reconstruct(&subset).expect("reconstruct"), secret);
    }

    /// More than `threshold` shares also work.
    #[test]
    fn all_shares_reconstruct(
        secret in prop::collection::vec(any::<u8>(), 1..100),
        (t, n) in threshold_and_total(),
    ) {
        let shards = split(&secret, t, n, creator(), 1).expect("split");
        prop_assert_eq!(reconstruct(&shards).expect("reconstruct"), secret);
    }

    /// Fewer than `threshold` distinct shares never reconstruct.
    #[test]
    fn below_threshold_fails(
        secret in prop::collection::vec(any::<u8>(), 1..64),
        n in 2usize..=10,
    ) {
        let shards = split(&secret, n, n, creator(), 1).expect("split");
        let err = reconstruct(&shards[..n - 1]).unwrap_err();
        let is_insufficient = matches!(
            err,
            KeywardError::Protocol(ProtocolError::InsufficientShares { .. })
        );
        prop_assert!(is_insufficient);
    }

    /// Out-of-range parameters are rejected.
    #[test]
    fn invalid_parameters_rejected(t in 0usize..20, n in 0usize..20) {
        prop_assume!(!(1..=n).contains(&t) || n > 10);
        prop_assert!(split(b"k", t, n, creator(), 1).is_err());
    }

    /// Share metadata is consistent and indices are 1..=n.
    #[test]
    fn share_metadata(
        len in 0usize..100,
        (t, n) in threshold_and_total(),
    ) {
        let secret = vec![0xA5; len];
        let shards = split(&secret, t, n, creator(), 1).expect("split");
        for (i, shard) in shards.iter().enumerate() {
            prop_assert_eq!(shard.shard_index as usize, i + 1);
            prop_assert_eq!(shard.threshold as usize, t);
            prop_assert_eq!(shard.total_shards as usize, n);
            prop_assert_eq!(shard.secret_len as usize, len);
            prop_assert!(shard.validate().is_ok());
        }
    }
}
