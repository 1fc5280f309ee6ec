//! Deterministic gateway identities and display-name handling.
//!
//! A stable ID is derived from the address record only (service type plus
//! raw instance name for discovered gateways, host plus port for manual
//! ones). Display names are never hashed, so renaming a gateway keeps its
//! persisted preferences and trust pins.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SERVICE_NAMESPACE: &str = "service";
const MANUAL_NAMESPACE: &str = "manual";

/// Product suffix appended by gateways to their instance names.
const PRODUCT_SUFFIX: &str = "(openclaw)";

/// Identity of one advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Raw (possibly DNS-SD escaped) instance name.
    pub name: String,
    /// Service type, e.g. `_openclaw-gw._tcp`.
    pub service_type: String,
    /// Domain the instance was seen in.
    pub domain: String,
}

impl ServiceIdentity {
    /// Create a new service identity.
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            domain: domain.into(),
        }
    }

    /// Stable ID of this instance. Independent of the domain.
    pub fn stable_id(&self) -> String {
        discovered_stable_id(&self.service_type, &self.name)
    }

    /// Diagnostic string: `name.type.domain`.
    pub fn debug_id(&self) -> String {
        format!(
            "{}.{}.{}",
            decode_instance_name(&self.name),
            self.service_type.trim_end_matches('.'),
            self.domain
        )
    }
}

/// Stable ID for a discovered service instance.
pub fn discovered_stable_id(service_type: &str, raw_name: &str) -> String {
    let service_type = service_type.trim_end_matches('.').to_ascii_lowercase();
    let name = normalize_name_for_id(raw_name);
    derive(
        SERVICE_NAMESPACE,
        &[service_type.as_bytes(), name.as_bytes()],
    )
}

/// Stable ID for a manually entered endpoint.
///
/// Lives in its own namespace so a manual entry never collides with a
/// discovered gateway that happens to share the address.
pub fn manual_stable_id(host: &str, port: u16) -> String {
    let host = host.trim().to_lowercase();
    derive(
        MANUAL_NAMESPACE,
        &[host.as_bytes(), &port.to_be_bytes()],
    )
}

fn derive(namespace: &str, parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"gateway-discovery:");
    hasher.update(namespace.as_bytes());
    hasher.update(b":v1:");
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let hex = hash[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    format!("{namespace}:{hex}")
}

fn normalize_name_for_id(raw_name: &str) -> String {
    collapse_whitespace(&decode_instance_name(raw_name))
}

/// Decode DNS-SD escapes (`\032`, `\.`) in an instance name.
pub fn decode_instance_name(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let digits = &bytes[i + 1..(i + 4).min(bytes.len())];
            if digits.len() == 3 && digits.iter().all(u8::is_ascii_digit) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
            out.push(bytes[i + 1]);
            i += 2;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Human-friendly form of a gateway name.
///
/// Collapses whitespace and strips the product suffix and a trailing
/// duplicate counter such as `(2)`.
pub fn prettify(name: &str) -> String {
    let mut out = collapse_whitespace(name);
    loop {
        let stripped = strip_product_suffix(strip_count_suffix(&out));
        if stripped.len() == out.len() {
            return out;
        }
        out = stripped.trim_end().to_string();
    }
}

fn strip_count_suffix(s: &str) -> &str {
    let Some(body) = s.strip_suffix(')') else {
        return s;
    };
    let Some(open) = body.rfind('(') else {
        return s;
    };
    let digits = &body[open + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return s;
    }
    let head = &s[..open];
    if !head.is_empty() && !head.ends_with(' ') {
        return s;
    }
    head.trim_end()
}

fn strip_product_suffix(s: &str) -> &str {
    if s.len() < PRODUCT_SUFFIX.len() {
        return s;
    }
    let split = s.len() - PRODUCT_SUFFIX.len();
    if !s.is_char_boundary(split) || !s[split..].eq_ignore_ascii_case(PRODUCT_SUFFIX) {
        return s;
    }
    let head = &s[..split];
    if !head.is_empty() && !head.ends_with(' ') {
        return s;
    }
    head.trim_end()
}

/// Pick the display name for a gateway.
///
/// The advertised name wins when it is non-empty after prettification,
/// otherwise the decoded raw instance name is used.
pub fn display_name(advertised: Option<&str>, raw_instance_name: &str) -> String {
    if let Some(name) = advertised.map(prettify).filter(|n| !n.is_empty()) {
        return name;
    }
    prettify(&decode_instance_name(raw_instance_name))
}

/// Normalize a host value: trim, strip one trailing dot, empty becomes `None`.
pub fn normalize_host(host: Option<&str>) -> Option<String> {
    let host = host?.trim();
    let host = host.strip_suffix('.').unwrap_or(host).trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
