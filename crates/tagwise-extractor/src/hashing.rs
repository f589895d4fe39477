//! Stable feature hashing
//!
//! Feature keys must hash identically across processes and platforms, since
//! trained weights are indexed by them. SipHash-1-3 with fixed keys gives
//! that; `std`'s `RandomState` would not.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

const KEY_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Hash `bytes` under `seed`
pub fn hash_bytes(bytes: &[u8], seed: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(seed, seed ^ KEY_MIX);
    hasher.write(bytes);
    hasher.finish()
}

pub fn hash_str(s: &str, seed: u64) -> u64 {
    hash_bytes(s.as_bytes(), seed)
}

/// Hash a pair of keys, e.g. a role and a lexical key
pub fn combine(a: u64, b: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(a, KEY_MIX);
    hasher.write_u64(b);
    hasher.finish()
}

/// Bucket a key into `[0, dims)`
pub fn bucket(key: u64, dims: usize) -> u32 {
    // dims is bounded by the u32 index space of sparse vectors
    (key % dims as u64) as u32
}

/// Pseudo-random sign for a key, decorrelated from its bucket
pub fn sign(key: u64) -> f32 {
    if key >> 63 == 1 {
        1.0
    } else {
        -1.0
    }
}

/// Light suffix-stripping stemmer for English
///
/// Conflates common inflections ("works", "worked", "working")
/// so lexical features generalize across word forms.
pub fn stem(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.chars().count() <= 3 || !lower.chars().all(|c| c.is_ascii_alphabetic()) {
        return lower;
    }

    let has_vowel = |s: &str| s.chars().any(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y'));

    let mut w = lower.as_str();
    if let Some(base) = w.strip_suffix("sses") {
        return format!("{base}ss");
    }
    if let Some(base) = w.strip_suffix("ies") {
        return format!("{base}i");
    }
    if !w.ends_with("ss") && !w.ends_with("us") {
        if let Some(base) = w.strip_suffix('s') {
            w = base;
        }
    }

    for (suffix, replacement) in [
        ("ational", "ate"),
        ("ization", "ize"),
        ("fulness", "ful"),
        ("ousness", "ous"),
        ("iveness", "ive"),
        ("tional", "tion"),
        ("ement", ""),
        ("ness", ""),
        ("ment", ""),
        ("ing", ""),
        ("ful", ""),
        ("ed", ""),
        ("ly", ""),
    ] {
        if let Some(base) = w.strip_suffix(suffix) {
            if base.len() >= 2 && has_vowel(base) {
                return format!("{base}{replacement}");
            }
        }
    }

    w.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        // Weights on disk depend on these staying fixed across builds
        assert_eq!(hash_str("Davis", 0), hash_str("Davis", 0));
        assert_ne!(hash_str("Davis", 0), hash_str("Davis", 1));
        assert_ne!(hash_str("Davis", 0), hash_str("davis", 0));
        assert_ne!(combine(1, 2), combine(2, 1));
    }

    #[test]
    fn test_bucket_in_range() {
        for word in ["a", "bb", "MIT", "Carnegie"] {
            assert!(bucket(hash_str(word, 7), 100) < 100);
        }
    }

    #[test]
    fn test_stem() {
        assert_eq!(stem("running"), "runn");
        assert_eq!(stem("Works"), "work");
        assert_eq!(stem("worked"), "work");
        assert_eq!(stem("classes"), "class");
        assert_eq!(stem("companies"), "compani");
        assert_eq!(stem("national"), "nation");
        assert_eq!(stem("MIT"), "mit");
        assert_eq!(stem("U.S."), "u.s.");
        assert_eq!(stem("status"), "status");
    }
}
