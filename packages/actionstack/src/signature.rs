//! Capability signatures for privileged middleware.
//!
//! A middleware that needs the lock, the execution stack or the strategy flag
//! presents a signature of the form `name.checksum`. The checksum is a
//! truncated SHA-256 over the name, so a signature can only be produced by
//! code that links this crate and calls [`sign`] on purpose.
//!
//! ```ignore
//! struct Tracer;
//!
//! #[async_trait]
//! impl Middleware for Tracer {
//!     fn name(&self) -> &str { "tracer" }
//!     fn signature(&self) -> Option<&str> { Some(TRACER_SIGNATURE) }
//!     // ...
//! }
//!
//! static TRACER_SIGNATURE: LazyLock<String> = LazyLock::new(|| signature::sign("tracer"));
//! ```

use sha2::{Digest, Sha256};

const DOMAIN: &[u8] = b"actionstack/middleware-capability/v1";
const CHECKSUM_LEN: usize = 16;

fn checksum(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(CHECKSUM_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Produce the signature granting privileged access to `name`.
pub fn sign(name: &str) -> String {
    format!("{name}.{}", checksum(name))
}

/// True if `signature` is a valid `name.checksum` pair.
pub fn is_valid_signature(signature: &str) -> bool {
    match signature.rsplit_once('.') {
        Some((name, sum)) if !name.is_empty() && sum.len() == CHECKSUM_LEN => {
            checksum(name) == sum
        }
        _ => false,
    }
}
