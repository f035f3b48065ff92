use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = jamroom_common::id::prefixed_ulid("usr");
/// assert!(id.starts_with("usr_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Returns `true` when `id` is `<prefix>_<ulid>` with a well-formed ULID.
///
/// Route handlers use this to reject malformed path ids before touching
/// storage.
///
/// # Examples
/// ```
/// let id = jamroom_common::id::prefixed_ulid("ses");
/// assert!(jamroom_common::id::is_prefixed_ulid(&id, "ses"));
/// assert!(!jamroom_common::id::is_prefixed_ulid(&id, "usr"));
/// ```
pub fn is_prefixed_ulid(id: &str, prefix: &str) -> bool {
    match id.split_once('_') {
        Some((p, rest)) => p == prefix && Ulid::from_string(rest).is_ok(),
        None => false,
    }
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }

    fn is_valid_id(id: &str) -> bool {
        is_prefixed_ulid(id, Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const USER: &str = "usr";
    pub const SESSION: &str = "ses";
    pub const APPLICATION: &str = "app";
    pub const GATEWAY: &str = "gw";
}
