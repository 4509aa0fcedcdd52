//! HMAC authentication for the signed request layer (spec §4.3).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::constants::CLIENT_VERSION;

type HmacSha1 = Hmac<Sha1>;

/// `tenant+group`, `group`, or `tenant` depending on which are present.
pub fn sign_body(tenant: &str, group: &str) -> String {
    match (tenant.is_empty(), group.is_empty()) {
        (false, false) => format!("{tenant}+{group}"),
        (true, false) => group.to_string(),
        _ => tenant.to_string(),
    }
}

/// `base64(HMAC-SHA1(secretKey, signBody + "+" + timestamp))`.
pub fn sign(secret_key: &str, tenant: &str, group: &str, timestamp_ms: u64) -> String {
    let data = format!("{}+{timestamp_ms}", sign_body(tenant, group));
    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(data.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// The headers every outbound request carries, per spec §4.3.
pub fn auth_headers(
    access_key: &str,
    secret_key: &str,
    tenant: &str,
    group: &str,
    timestamp_ms: u64,
) -> Vec<(String, String)> {
    vec![
        ("Client-Version".to_string(), CLIENT_VERSION.to_string()),
        (
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=UTF-8".to_string(),
        ),
        ("Spas-AccessKey".to_string(), access_key.to_string()),
        ("timeStamp".to_string(), timestamp_ms.to_string()),
        ("exConfigInfo".to_string(), "true".to_string()),
        (
            "Spas-Signature".to_string(),
            sign(secret_key, tenant, group, timestamp_ms),
        ),
    ]
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_body_uses_tenant_and_group_when_both_present() {
        assert_eq!(sign_body("tenant1", "group1"), "tenant1+group1");
    }

    #[test]
    fn sign_body_uses_group_only_when_tenant_absent() {
        assert_eq!(sign_body("", "group1"), "group1");
    }

    #[test]
    fn sign_body_uses_tenant_only_when_group_absent() {
        assert_eq!(sign_body("tenant1", ""), "tenant1");
        assert_eq!(sign_body("tenant1", ""), sign_body("tenant1", ""));
    }

    #[test]
    fn signature_changes_with_timestamp() {
        let a = sign("secret", "tenant1", "group1", 1000);
        let b = sign("secret", "tenant1", "group1", 1001);
        assert_ne!(a, b);
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign("secret", "tenant1", "group1", 1000);
        let b = sign("secret", "tenant1", "group1", 1000);
        assert_eq!(a, b);
    }
}
