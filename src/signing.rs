//! HMAC-SHA256 helpers shared by inbound verification and outbound signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

pub type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message` under `secret`.
pub fn sign_hex(secret: &[u8], message: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ServiceError::InternalError(format!("invalid hmac key: {}", e)))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex signature in constant time. Malformed hex never matches.
pub fn verify_hex(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let sig = sign_hex(b"secret", b"order_1|pay_1").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_hex(b"secret", b"order_1|pay_1", &sig));
        assert!(!verify_hex(b"other", b"order_1|pay_1", &sig));
        assert!(!verify_hex(b"secret", b"order_1|pay_2", &sig));
    }

    #[test]
    fn malformed_signatures_never_match() {
        assert!(!verify_hex(b"secret", b"x", "not-hex"));
        assert!(!verify_hex(b"secret", b"x", ""));
        assert!(!verify_hex(b"secret", b"x", "abcd"));
    }

    #[test]
    fn matches_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
