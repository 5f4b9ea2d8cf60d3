use sha1::{Digest, Sha1};

/// SHA-1 of one buffer prefix, computed at most once.
///
/// The resume check interrogates the same scan buffer with two candidate
/// lengths: a full-length piece and the shorter final piece. Each length
/// gets its own hasher, so a digest is only paid for when some candidate
/// actually needs it, and never twice.
pub(crate) struct LazyHasher<'a> {
    data: &'a [u8],
    len: usize,
    digest: Option<[u8; 20]>,
}

impl<'a> LazyHasher<'a> {
    pub(crate) fn new(data: &'a [u8], len: usize) -> Self {
        Self {
            data,
            len,
            digest: None,
        }
    }

    pub(crate) fn get(&mut self) -> [u8; 20] {
        *self.digest.get_or_insert_with(|| {
            let mut hasher = Sha1::new();
            hasher.update(&self.data[..self.len]);
            hasher.finalize().into()
        })
    }
}
