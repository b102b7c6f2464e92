use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Source of file identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random URL-safe tokens.
///
/// Nine random bytes encode to twelve base64url characters (72 bits), so a
/// collision among a few million live records stays around one in a billion.
#[derive(Debug, Clone)]
pub struct RandomIdGenerator {
    bytes: usize,
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self { bytes: 9 }
    }

    pub fn with_bytes(bytes: usize) -> Self {
        Self { bytes: bytes.max(1) }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        let mut buf = vec![0u8; self.bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }
}
