//! Per-request scratch space threaded through the middleware chain (§3).

use std::collections::HashMap;

/// Stage kinds an earlier stage may ask later stages to skip. A plain bitset
/// over `u16`; small enough and fixed enough that a dependency isn't worth it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipFlags(u16);

impl SkipFlags {
    pub const RATE_LIMIT: SkipFlags = SkipFlags(1 << 0);
    pub const WAF: SkipFlags = SkipFlags(1 << 1);
    pub const VALIDATION: SkipFlags = SkipFlags(1 << 2);
    pub const COMPRESSION: SkipFlags = SkipFlags(1 << 3);
    pub const MIRROR: SkipFlags = SkipFlags(1 << 4);
    pub const ACCESS_LOG: SkipFlags = SkipFlags(1 << 5);
    pub const THROTTLE: SkipFlags = SkipFlags(1 << 6);

    pub fn insert(&mut self, other: SkipFlags) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: SkipFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Identity established by the authentication stage, if any.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub claims: HashMap<String, String>,
}

/// Client certificate info captured by mTLS termination, if any.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject: String,
    pub fingerprint: String,
}

/// Scratch state a request carries through the whole chain. Lives in the
/// request's extension slot; owned exclusively by the request's task (§5).
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub request_id: String,
    pub path_params: HashMap<String, String>,
    pub identity: Option<Identity>,
    pub cert_info: Option<CertInfo>,
    /// Free-form overrides an earlier stage injects for a later one, e.g. a
    /// bandwidth override computed by a quota stage.
    pub overrides: HashMap<String, String>,
    pub skip_flags: SkipFlags,
    pub route_id: Option<String>,
}

impl VariableContext {
    pub fn new(request_id: String) -> Self {
        Self { request_id, ..Default::default() }
    }

    pub fn skip(&self, flag: SkipFlags) -> bool {
        self.skip_flags.contains(flag)
    }
}
