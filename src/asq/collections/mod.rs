//! Collection types used across the crate, with a feature
//! selected hash builder.

#[cfg(feature = "collections_randomstate_std")]
pub type RandomState = std::collections::hash_map::RandomState;

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = twox_hash::RandomXxHashBuilder64;

/// A `HashMap` keyed with the crate-wide hash builder.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` keyed with the crate-wide hash builder.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// Creates a new, empty `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::with_hasher(RandomState::default())
}

/// Creates a new, empty `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::with_hasher(RandomState::default())
}
