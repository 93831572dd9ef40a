//! Collection types with a configurable hash function backend.

#[cfg(feature = "collections_randomstate_twox_hash")]
use std::hash::BuildHasherDefault;

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = BuildHasherDefault<::twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
pub type RandomState = std::collections::hash_map::RandomState;

/// A map which may use a different hash function
/// from the one found in the standard library.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A set which may use a different hash function
/// from the one found in the standard library.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// An ordered map, whose iteration order follows insertion order.
pub type OrderedMap<K, V> = ::linked_hash_map::LinkedHashMap<K, V>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K, V>(n: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(n, Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::default()
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: std::hash::Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}
