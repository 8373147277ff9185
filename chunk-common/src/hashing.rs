use base64::{engine::general_purpose::URL_SAFE, Engine};

/// An in-progress content fingerprint, fed one fragment at a time.
pub trait ContentHasher {
    fn update(&mut self, fragment: &[u8]);
    fn finish(self) -> String;
}

/// Produces short, fixed-format fingerprints of chunk content.
///
/// Both `hash` and `hash_streamed` go through the same `ContentHasher`, so feeding content as a
/// sequence of fragments always yields the same fingerprint as hashing the concatenated buffer.
pub trait HashProvider: Send + Sync {
    type Hasher: ContentHasher;

    fn hasher(&self) -> Self::Hasher;

    fn hash(&self, content: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(content);
        hasher.finish()
    }

    /// Hash content too large to be held in memory at once.
    fn hash_streamed<I, B>(&self, fragments: I) -> String
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = self.hasher();
        for fragment in fragments {
            hasher.update(fragment.as_ref());
        }
        hasher.finish()
    }
}

/// MD5 digest encoded as URL-safe base64: always 24 characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Base64;

pub struct Md5Base64Hasher(md5::Context);

impl ContentHasher for Md5Base64Hasher {
    fn update(&mut self, fragment: &[u8]) {
        self.0.consume(fragment);
    }

    fn finish(self) -> String {
        URL_SAFE.encode(self.0.compute().0)
    }
}

impl HashProvider for Md5Base64 {
    type Hasher = Md5Base64Hasher;

    fn hasher(&self) -> Self::Hasher {
        Md5Base64Hasher(md5::Context::new())
    }
}
