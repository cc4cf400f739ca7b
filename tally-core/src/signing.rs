/*!
HMAC-SHA256 body signatures.

When a shared key is configured the agent sends the hex-encoded HMAC of the
exact bytes it puts on the wire in the [`SIGNATURE_HEADER`] header, and the
server recomputes it over the bytes it receives.
*/

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the hex-encoded body signature
pub const SIGNATURE_HEADER: &str = "HashSHA256";

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies request bodies with a shared key
///
/// # Example
/// ```rust
/// use tally_core::BodySigner;
///
/// let signer = BodySigner::new("secret");
/// let signature = signer.sign(b"[]");
/// assert_eq!(signature.len(), 64);
/// assert!(signer.verify(b"[]", &signature));
/// assert!(!signer.verify(b"[ ]", &signature));
/// ```
#[derive(Clone)]
pub struct BodySigner {
    key: Vec<u8>,
}

impl BodySigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    /// Build a signer only for a non-empty key
    pub fn from_key(key: Option<&str>) -> Option<Self> {
        key.filter(|k| !k.is_empty()).map(Self::new)
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
    }

    /// Hex-encoded HMAC-SHA256 of `body`
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        format!("{:x}", mac.finalize().into_bytes())
    }

    /// Constant-time comparison of `signature` against the body's HMAC
    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Some(expected) = decode_hex(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for BodySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySigner").field("key", &"<redacted>").finish()
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signer = BodySigner::new("Jefe");
        assert_eq!(
            signer.sign(b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let signer = BodySigner::new("key");
        let signature = signer.sign(b"payload");

        assert!(signer.verify(b"payload", &signature));
        assert!(signer.verify(b"payload", &signature.to_uppercase()));
        assert!(!signer.verify(b"payload!", &signature));
        assert!(!BodySigner::new("other").verify(b"payload", &signature));
    }

    #[test]
    fn test_verify_rejects_malformed_hex() {
        let signer = BodySigner::new("key");
        assert!(!signer.verify(b"payload", ""));
        assert!(!signer.verify(b"payload", "abc"));
        assert!(!signer.verify(b"payload", "zz"));
    }

    #[test]
    fn test_empty_key_disables_signing() {
        assert!(BodySigner::from_key(None).is_none());
        assert!(BodySigner::from_key(Some("")).is_none());
        assert!(BodySigner::from_key(Some("k")).is_some());
    }
}
