// Correlation cookie helpers

use testbed_core::TestIdentity;

/// `name=identity`, suitable for a `Cookie` request header.
pub fn correlation_cookie(name: &str, identity: TestIdentity) -> String {
    format!("{}={}", name, identity)
}

/// `Set-Cookie` value carrying `identity`, scoped to the whole site.
pub fn set_correlation_cookie(name: &str, identity: TestIdentity) -> String {
    format!("{}={}; Path=/; SameSite=Lax", name, identity)
}

/// The identity stored under `name` in a `Cookie` header, if any.
pub fn identity_from_cookie_header(name: &str, header: &str) -> Option<TestIdentity> {
    header
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .and_then(|(_, value)| value.trim().trim_matches('"').parse().ok())
}
