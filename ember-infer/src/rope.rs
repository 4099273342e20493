/// Precomputed rotary embedding angles for positions `0..max_pos`.
///
/// Pairs are interleaved (`x[2i]`, `x[2i+1]`), as in GGUF Llama checkpoints.
#[derive(Debug, Clone)]
pub struct RopeTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    half_dim: usize,
    max_pos: usize,
}

impl RopeTable {
    pub fn new(max_pos: usize, rotary_dim: usize, freq_base: f32, freq_scale: f32) -> Self {
        let half = rotary_dim / 2;
        let mut cos = vec![0.0f32; max_pos * half];
        let mut sin = vec![0.0f32; max_pos * half];
        for pos in 0..max_pos {
            for i in 0..half {
                let freq = 1.0 / freq_base.powf(2.0 * i as f32 / rotary_dim as f32);
                let (s, c) = (pos as f32 * freq_scale * freq).sin_cos();
                cos[pos * half + i] = c;
                sin[pos * half + i] = s;
            }
        }
        Self {
            cos,
            sin,
            half_dim: half,
            max_pos,
        }
    }

    pub fn max_pos(&self) -> usize {
        self.max_pos
    }

    /// Rotate every head in `vec` to position `pos`.
    pub fn apply(&self, vec: &mut [f32], pos: usize, head_dim: usize) {
        self.rotate(vec, pos, head_dim, 1.0);
    }

    /// Undo a rotation by `delta` positions: a key rotated for position `p`
    /// ends up rotated for `p - delta`.
    pub fn shift_back(&self, vec: &mut [f32], delta: usize, head_dim: usize) {
        self.rotate(vec, delta, head_dim, -1.0);
    }

    fn rotate(&self, vec: &mut [f32], pos: usize, head_dim: usize, direction: f32) {
        let half = self.half_dim;
        let base = pos * half;
        for head in vec.chunks_exact_mut(head_dim) {
            for i in 0..half {
                let c = self.cos[base + i];
                let s = self.sin[base + i] * direction;
                let x0 = head[2 * i];
                let x1 = head[2 * i + 1];
                head[2 * i] = x0 * c - x1 * s;
                head[2 * i + 1] = x0 * s + x1 * c;
            }
        }
    }
}
