use siphasher::sip::SipHasher;
use std::hash::{Hash, Hasher};

/// Default hashmap for trove. Opts-out of more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Default hashset for trove. Opts-out of more expensive secure hash.
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

/// Hashes a value with fixed keys, so the result is the same every time the process runs. Location
/// hashes feed the operation cache and must not change while a location is alive.
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = SipHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Folds `value` into `seed` the same way for every location and dependency hash
#[inline]
pub fn combine_hash(
    seed: u64,
    value: u64,
) -> u64 {
    seed.wrapping_mul(31).wrapping_add(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_stable_hash_is_repeatable() {
        assert_eq!(stable_hash("TestLocationID"), stable_hash("TestLocationID"));
        assert_ne!(stable_hash("TestLocationID"), stable_hash("CacheLocationID"));
    }

    #[test]
    fn check_combine_hash_is_order_dependent() {
        let a = combine_hash(combine_hash(17, 1), 2);
        let b = combine_hash(combine_hash(17, 2), 1);
        assert_ne!(a, b);
        assert_eq!(combine_hash(17, 0), 17 * 31);
    }
}
