use crate::params::CacheType;
use crate::rope::RopeTable;
use ember_core::error::{EmberError, Result};

const SESSION_MAGIC: &[u8; 8] = b"EMBRSESS";
const SESSION_VERSION: u32 = 1;

/// Per-session attention state.
///
/// Slot `i` holds the keys/values of `history[i]`, rotated for position `i`.
/// Entries past `history.len()` are stale and never read.
#[derive(Debug, Clone)]
pub struct KvCache {
    n_layers: usize,
    kv_stride: usize,
    head_dim: usize,
    n_ctx: usize,
    k: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    history: Vec<u32>,
}

impl KvCache {
    pub fn new(n_layers: usize, n_kv_heads: usize, head_dim: usize, n_ctx: usize) -> Self {
        let kv_stride = n_kv_heads * head_dim;
        Self {
            n_layers,
            kv_stride,
            head_dim,
            n_ctx,
            k: vec![vec![0.0; n_ctx * kv_stride]; n_layers],
            v: vec![vec![0.0; n_ctx * kv_stride]; n_layers],
            history: Vec::with_capacity(n_ctx),
        }
    }

    /// Log the requested element types; storage here is always f32.
    pub fn note_types(&self, k: CacheType, v: CacheType) {
        if k != CacheType::F32 || v != CacheType::F32 {
            tracing::debug!("kv cache types {k:?}/{v:?} requested, storing f32");
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.n_ctx
    }

    pub fn is_full(&self) -> bool {
        self.history.len() >= self.n_ctx
    }

    pub fn history(&self) -> &[u32] {
        &self.history
    }

    pub fn size_bytes(&self) -> usize {
        2 * self.n_layers * self.n_ctx * self.kv_stride * std::mem::size_of::<f32>()
    }

    pub fn kv_stride(&self) -> usize {
        self.kv_stride
    }

    pub fn write(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        let off = pos * self.kv_stride;
        self.k[layer][off..off + self.kv_stride].copy_from_slice(k);
        self.v[layer][off..off + self.kv_stride].copy_from_slice(v);
    }

    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.k[layer]
    }

    pub fn values(&self, layer: usize) -> &[f32] {
        &self.v[layer]
    }

    /// Record the token whose K/V were just written at slot `len()`.
    pub fn commit(&mut self, token: u32) {
        self.history.push(token);
    }

    /// Drop everything from slot `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.history.truncate(len);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Remove `n_discard` slots starting at `keep`, sliding the tail down and
    /// re-rotating its keys for their new positions.
    pub fn discard(&mut self, keep: usize, n_discard: usize, rope: &RopeTable) {
        let len = self.history.len();
        if n_discard == 0 || keep >= len {
            return;
        }
        let n_discard = n_discard.min(len - keep);
        let stride = self.kv_stride;
        let src = (keep + n_discard) * stride..len * stride;
        for layer in 0..self.n_layers {
            self.k[layer].copy_within(src.clone(), keep * stride);
            self.v[layer].copy_within(src.clone(), keep * stride);
            let moved = len - keep - n_discard;
            for slot in keep..keep + moved {
                let row = &mut self.k[layer][slot * stride..(slot + 1) * stride];
                rope.shift_back(row, n_discard, self.head_dim);
            }
        }
        self.history.drain(keep..keep + n_discard);
        tracing::debug!("kv cache shifted: kept {keep}, discarded {n_discard}, now {}", self.len());
    }

    /// Encode the most recent `max_tokens` entries (all when `max_tokens` is
    /// 0 or exceeds the length), re-based to start at slot 0.
    pub fn serialize(&self, fingerprint: &[u8; 32], max_tokens: usize, rope: &RopeTable) -> Vec<u8> {
        let len = self.len();
        let n = if max_tokens == 0 { len } else { max_tokens.min(len) };
        let skip = len - n;
        let stride = self.kv_stride;

        let mut out = Vec::with_capacity(64 + n * 4 + 2 * self.n_layers * n * stride * 4);
        out.extend_from_slice(SESSION_MAGIC);
        out.extend_from_slice(&SESSION_VERSION.to_le_bytes());
        out.extend_from_slice(fingerprint);
        for dim in [self.n_layers, stride, n] {
            out.extend_from_slice(&(dim as u32).to_le_bytes());
        }
        for &tok in &self.history[skip..] {
            out.extend_from_slice(&tok.to_le_bytes());
        }
        for layer in 0..self.n_layers {
            let mut keys = self.k[layer][skip * stride..len * stride].to_vec();
            if skip > 0 {
                for row in keys.chunks_exact_mut(stride) {
                    rope.shift_back(row, skip, self.head_dim);
                }
            }
            out.extend_from_slice(bytemuck::cast_slice(&keys));
            out.extend_from_slice(bytemuck::cast_slice(&self.v[layer][skip * stride..len * stride]));
        }
        out
    }

    /// Replace the whole cache with a serialized image.
    pub fn deserialize(&mut self, bytes: &[u8], fingerprint: &[u8; 32]) -> Result<usize> {
        let fail = |msg: &str| EmberError::SessionLoadFailed(msg.to_string());
        let mut r = Reader { bytes, pos: 0 };

        if r.take(8).map_err(|_| fail("truncated header"))? != SESSION_MAGIC {
            return Err(fail("not a session file"));
        }
        let version = r.u32()?;
        if version != SESSION_VERSION {
            return Err(fail(&format!("unsupported session version {version}")));
        }
        if r.take(32)? != fingerprint {
            return Err(fail("session was saved with a different model"));
        }
        let (n_layers, stride, n) = (r.u32()? as usize, r.u32()? as usize, r.u32()? as usize);
        if n_layers != self.n_layers || stride != self.kv_stride {
            return Err(fail("cache geometry does not match this model"));
        }
        if n > self.n_ctx {
            return Err(fail(&format!(
                "session holds {n} tokens, context is {}",
                self.n_ctx
            )));
        }

        let mut history = Vec::with_capacity(n);
        for _ in 0..n {
            history.push(r.u32()?);
        }
        let span = n * stride;
        let mut k = self.k.clone();
        let mut v = self.v.clone();
        for layer in 0..n_layers {
            bytemuck::cast_slice_mut::<f32, u8>(&mut k[layer][..span]).copy_from_slice(r.take(span * 4)?);
            bytemuck::cast_slice_mut::<f32, u8>(&mut v[layer][..span]).copy_from_slice(r.take(span * 4)?);
        }
        if r.pos != bytes.len() {
            return Err(fail("trailing bytes after cache data"));
        }
        self.k = k;
        self.v = v;
        self.history = history;
        Ok(n)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return Err(EmberError::SessionLoadFailed("truncated session file".into()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
