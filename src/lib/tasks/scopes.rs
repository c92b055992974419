//! Scope matching for capability gates.
//!
//! A held scope satisfies a required scope when it is equal to it, or when it
//! ends in `*` and the required scope starts with everything before the `*`.

pub const CACHE_SCOPE_PREFIX: &str = "cache-access:";
pub const PRIVILEGED_SCOPE: &str = "capability:privileged";
pub const DEVICE_SCOPE_PREFIX: &str = "capability:device:";

pub fn satisfies(held: &str, required: &str) -> bool {
    match held.strip_suffix('*') {
        Some(prefix) => required.starts_with(prefix),
        None => held == required,
    }
}

/// True when every required scope is satisfied by at least one held scope.
pub fn scope_match<S: AsRef<str>>(held: &[S], required: &[String]) -> bool {
    required
        .iter()
        .all(|req| held.iter().any(|h| satisfies(h.as_ref(), req)))
}

/// Required scopes that no held scope satisfies.
pub fn missing_scopes<S: AsRef<str>>(held: &[S], required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|req| !held.iter().any(|h| satisfies(h.as_ref(), req)))
        .cloned()
        .collect()
}

pub fn cache_scope(name: &str) -> String {
    format!("{CACHE_SCOPE_PREFIX}{name}")
}

pub fn device_scope(device: &str) -> String {
    format!("{DEVICE_SCOPE_PREFIX}{device}")
}
