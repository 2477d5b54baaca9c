//! Streaming digest over the logical page stream.
//!
//! The digest covers the plaintext, pre-compression data, so the verify
//! pass can recompute it after inverting the transforms.

/// MD5 over everything fed in; a disabled checksum swallows updates and
/// reports an all-zero digest.
pub struct Checksum {
    ctx: Option<md5::Context>,
}

impl Checksum {
    pub fn new(enabled: bool) -> Self {
        Checksum {
            ctx: enabled.then(md5::Context::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(ctx) = &mut self.ctx {
            ctx.consume(data);
        }
    }

    pub fn finish(self) -> [u8; 16] {
        match self.ctx {
            Some(ctx) => ctx.compute().0,
            None => [0; 16],
        }
    }
}
