#![allow(clippy::needless_range_loop)]
//! Dequantization kernels for the GGML block formats the engine reads.
//!
//! Matrix-vector products go through [`dot_row`], which walks a weight row
//! block by block and accumulates against the activation without ever
//! materializing the full f32 row.

use crate::dtype::DType;
use crate::error::{EmberError, Result};

/// IEEE 754 half to f32. Layout: 1 sign, 5 exponent, 10 mantissa.
#[inline(always)]
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exp = ((bits >> 10) & 0x1F) as u32;
    let mant = (bits & 0x3FF) as u32;

    if exp == 0 {
        if mant == 0 {
            return f32::from_bits(sign << 31);
        }
        // subnormal: renormalize the mantissa
        let mut m = mant;
        let mut e: i32 = -14;
        while (m & 0x400) == 0 {
            m <<= 1;
            e -= 1;
        }
        m &= 0x3FF;
        let f32_exp = ((e + 127) as u32) & 0xFF;
        f32::from_bits((sign << 31) | (f32_exp << 23) | (m << 13))
    } else if exp == 31 {
        f32::from_bits((sign << 31) | (0xFF << 23) | (mant << 13))
    } else {
        let f32_exp = (exp as i32 - 15 + 127) as u32;
        f32::from_bits((sign << 31) | (f32_exp << 23) | (mant << 13))
    }
}

/// f32 to IEEE 754 half, round-to-nearest-even, saturating to inf.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mant = bits & 0x7F_FFFF;

    if exp == 0xFF {
        let nan = if mant != 0 { 0x200 } else { 0 };
        return sign | 0x7C00 | nan;
    }
    let e = exp - 127 + 15;
    if e >= 0x1F {
        return sign | 0x7C00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = mant | 0x80_0000;
        let shift = (14 - e) as u32;
        let half = m >> shift;
        let rem = m & ((1 << shift) - 1);
        let mid = 1 << (shift - 1);
        let round = u32::from(rem > mid || (rem == mid && (half & 1) == 1));
        return sign | (half + round) as u16;
    }
    let half = ((e as u32) << 10) | (mant >> 13);
    let rem = mant & 0x1FFF;
    let round = u32::from(rem > 0x1000 || (rem == 0x1000 && (half & 1) == 1));
    sign | (half + round) as u16
}

#[inline(always)]
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

#[inline(always)]
fn read_f16(data: &[u8], offset: usize) -> f32 {
    f16_to_f32(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

fn dequant_q4_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(block, 0);
    let qs = &block[2..18];
    for j in 0..16 {
        out[j] = ((qs[j] & 0x0F) as i32 - 8) as f32 * d;
        out[j + 16] = ((qs[j] >> 4) as i32 - 8) as f32 * d;
    }
}

fn dequant_q4_1(block: &[u8], out: &mut [f32]) {
    let d = read_f16(block, 0);
    let m = read_f16(block, 2);
    let qs = &block[4..20];
    for j in 0..16 {
        out[j] = (qs[j] & 0x0F) as f32 * d + m;
        out[j + 16] = (qs[j] >> 4) as f32 * d + m;
    }
}

fn dequant_q8_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16(block, 0);
    for j in 0..32 {
        out[j] = block[2 + j] as i8 as f32 * d;
    }
}

/// Unpack the 6-bit scale and min for sub-block `j` of a Q4_K super-block.
fn q4k_scale_min(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        let sc = (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4);
        let m = (q[j + 4] >> 4) | ((q[j] >> 6) << 4);
        (sc, m)
    }
}

fn dequant_q4_k(block: &[u8], out: &mut [f32]) {
    let d = read_f16(block, 0);
    let dmin = read_f16(block, 2);
    let scales = &block[4..16];
    let qs = &block[16..144];

    for chunk in 0..4 {
        let q = &qs[chunk * 32..chunk * 32 + 32];
        let (sc1, m1) = q4k_scale_min(2 * chunk, scales);
        let (sc2, m2) = q4k_scale_min(2 * chunk + 1, scales);
        let (d1, min1) = (d * sc1 as f32, dmin * m1 as f32);
        let (d2, min2) = (d * sc2 as f32, dmin * m2 as f32);
        let base = chunk * 64;
        for l in 0..32 {
            out[base + l] = d1 * (q[l] & 0x0F) as f32 - min1;
            out[base + 32 + l] = d2 * (q[l] >> 4) as f32 - min2;
        }
    }
}

fn dequant_q6_k(block: &[u8], out: &mut [f32]) {
    let d = read_f16(block, 208);
    for half in 0..2 {
        let ql = &block[half * 64..half * 64 + 64];
        let qh = &block[128 + half * 32..128 + half * 32 + 32];
        let sc = &block[192 + half * 8..192 + half * 8 + 8];
        let y = &mut out[half * 128..half * 128 + 128];
        for l in 0..32 {
            let is = l / 16;
            let q1 = ((ql[l] & 0x0F) | ((qh[l] & 3) << 4)) as i32 - 32;
            let q2 = ((ql[l + 32] & 0x0F) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
            let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
            let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
            y[l] = d * (sc[is] as i8) as f32 * q1 as f32;
            y[l + 32] = d * (sc[is + 2] as i8) as f32 * q2 as f32;
            y[l + 64] = d * (sc[is + 4] as i8) as f32 * q3 as f32;
            y[l + 96] = d * (sc[is + 6] as i8) as f32 * q4 as f32;
        }
    }
}

/// Dequantize one block of `dtype` into `out` (`out.len() == block_size`).
pub fn dequant_block(dtype: DType, block: &[u8], out: &mut [f32]) -> Result<()> {
    if block.len() < dtype.size_of_block() || out.len() < dtype.block_size() {
        return Err(EmberError::Parse(format!(
            "short {} block: {} bytes",
            dtype.name(),
            block.len()
        )));
    }
    match dtype {
        DType::F32 => out[0] = f32::from_le_bytes([block[0], block[1], block[2], block[3]]),
        DType::F16 => out[0] = read_f16(block, 0),
        DType::BF16 => out[0] = bf16_to_f32(u16::from_le_bytes([block[0], block[1]])),
        DType::Q4_0 => dequant_q4_0(block, out),
        DType::Q4_1 => dequant_q4_1(block, out),
        DType::Q8_0 => dequant_q8_0(block, out),
        DType::Q4_K => dequant_q4_k(block, out),
        DType::Q6_K => dequant_q6_k(block, out),
    }
    Ok(())
}

/// Dequantize a full row of `out.len()` weights.
pub fn dequant_row(dtype: DType, row: &[u8], out: &mut [f32]) -> Result<()> {
    match dtype {
        DType::F32 => {
            for (o, chunk) in out.iter_mut().zip(row.chunks_exact(4)) {
                *o = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        DType::F16 => {
            for (o, chunk) in out.iter_mut().zip(row.chunks_exact(2)) {
                *o = f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
        }
        DType::BF16 => {
            for (o, chunk) in out.iter_mut().zip(row.chunks_exact(2)) {
                *o = bf16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
        }
        _ => {
            let bs = dtype.block_size();
            let bb = dtype.size_of_block();
            for (b, chunk) in out.chunks_mut(bs).enumerate() {
                dequant_block(dtype, &row[b * bb..(b + 1) * bb], chunk)?;
            }
        }
    }
    Ok(())
}

/// Dot product of one stored weight row with an f32 activation.
pub fn dot_row(dtype: DType, row: &[u8], act: &[f32]) -> f32 {
    match dtype {
        DType::F32 => row
            .chunks_exact(4)
            .zip(act)
            .map(|(c, a)| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) * a)
            .sum(),
        DType::F16 => row
            .chunks_exact(2)
            .zip(act)
            .map(|(c, a)| f16_to_f32(u16::from_le_bytes([c[0], c[1]])) * a)
            .sum(),
        DType::BF16 => row
            .chunks_exact(2)
            .zip(act)
            .map(|(c, a)| bf16_to_f32(u16::from_le_bytes([c[0], c[1]])) * a)
            .sum(),
        _ => {
            let bs = dtype.block_size();
            let bb = dtype.size_of_block();
            let mut tmp = [0.0f32; 256];
            let mut sum = 0.0f32;
            for (b, a) in act.chunks(bs).enumerate() {
                let block = &row[b * bb..(b + 1) * bb];
                // block sizes were validated when the tensor was indexed
                if dequant_block(dtype, block, &mut tmp[..bs]).is_err() {
                    continue;
                }
                sum += tmp[..a.len()].iter().zip(a).map(|(w, x)| w * x).sum::<f32>();
            }
            sum
        }
    }
}
