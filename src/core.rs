use std::sync::Arc;

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash.
///
/// Datasets take their fingerprint from it, so cache entries are keyed to
/// content rather than to a session object. It also names the archives
/// written by [`Environment::save`](crate::Environment::save).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 16 hex digits, enough to tell fingerprints apart in keys and logs.
    pub fn to_short_hex(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(16);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Streaming hasher for fingerprints built from several arrays and strings.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn update_str(&mut self, value: &str) -> &mut Self {
        // length prefix keeps ("ab", "c") and ("a", "bc") apart
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    pub fn update_f64s(&mut self, values: &[f64]) -> &mut Self {
        self.0.update(&(values.len() as u64).to_le_bytes());
        for value in values {
            self.0.update(&value.to_le_bytes());
        }
        self
    }

    pub fn update_usizes(&mut self, values: &[usize]) -> &mut Self {
        self.0.update(&(values.len() as u64).to_le_bytes());
        for value in values {
            self.0.update(&(*value as u64).to_le_bytes());
        }
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}
