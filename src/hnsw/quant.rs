use serde::{Deserialize, Serialize};

/// How node vectors are stored inside the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMode {
    F32,
    Q8,
    Bin,
}

impl QuantMode {
    pub fn name(self) -> &'static str {
        match self {
            QuantMode::F32 => "f32",
            QuantMode::Q8 => "int8",
            QuantMode::Bin => "bin",
        }
    }

    pub fn code(self) -> u64 {
        match self {
            QuantMode::F32 => 0,
            QuantMode::Q8 => 1,
            QuantMode::Bin => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(QuantMode::F32),
            1 => Some(QuantMode::Q8),
            2 => Some(QuantMode::Bin),
            _ => None,
        }
    }

    /// Byte length of one stored vector of `dim` components.
    pub fn bytes_for(self, dim: usize) -> usize {
        match self {
            QuantMode::F32 => dim.saturating_mul(4),
            QuantMode::Q8 => dim,
            QuantMode::Bin => dim.div_ceil(8),
        }
    }
}

/// A unit-length vector in its stored representation.
#[derive(Clone, Debug, PartialEq)]
pub enum StoredVector {
    F32(Vec<f32>),
    /// `range` is the max absolute component before quantization.
    Q8 { data: Vec<i8>, range: f32 },
    Bin { bits: Vec<u8>, dim: usize },
}

impl StoredVector {
    pub fn mode(&self) -> QuantMode {
        match self {
            StoredVector::F32(_) => QuantMode::F32,
            StoredVector::Q8 { .. } => QuantMode::Q8,
            StoredVector::Bin { .. } => QuantMode::Bin,
        }
    }

    pub fn range(&self) -> f32 {
        match self {
            StoredVector::Q8 { range, .. } => *range,
            _ => 0.0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            StoredVector::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            StoredVector::Q8 { data, .. } => data.iter().map(|&q| q as u8).collect(),
            StoredVector::Bin { bits, .. } => bits.clone(),
        }
    }

    /// Rebuilds a stored vector from raw bytes. `None` when the length does
    /// not match what `mode` expects for `dim`.
    pub fn from_bytes(mode: QuantMode, dim: usize, bytes: &[u8], range: f32) -> Option<Self> {
        if bytes.len() != mode.bytes_for(dim) {
            return None;
        }
        Some(match mode {
            QuantMode::F32 => StoredVector::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            QuantMode::Q8 => StoredVector::Q8 {
                data: bytes.iter().map(|&b| b as i8).collect(),
                range,
            },
            QuantMode::Bin => StoredVector::Bin {
                bits: bytes.to_vec(),
                dim,
            },
        })
    }

    pub fn heap_bytes(&self) -> usize {
        match self {
            StoredVector::F32(v) => v.capacity() * 4,
            StoredVector::Q8 { data, .. } => data.capacity(),
            StoredVector::Bin { bits, .. } => bits.capacity(),
        }
    }
}

/// Splits `vec` into its L2 norm and the unit vector pointing the same way.
/// A zero vector stays zero with norm 0.
pub fn normalize(vec: &[f32]) -> (Vec<f32>, f32) {
    let norm = dot_f32(vec, vec, true).sqrt();
    if norm <= f32::EPSILON {
        return (vec![0.0; vec.len()], 0.0);
    }
    (vec.iter().map(|x| x / norm).collect(), norm)
}

pub fn quantize(mode: QuantMode, unit: &[f32]) -> StoredVector {
    match mode {
        QuantMode::F32 => StoredVector::F32(unit.to_vec()),
        QuantMode::Q8 => {
            let mut max_abs = 0.0f32;
            for &x in unit {
                let ax = x.abs();
                if ax > max_abs {
                    max_abs = ax;
                }
            }
            let data = if max_abs <= f32::EPSILON {
                vec![0i8; unit.len()]
            } else {
                unit.iter()
                    .map(|&x| (x / max_abs * 127.0).round().clamp(-127.0, 127.0) as i8)
                    .collect()
            };
            StoredVector::Q8 {
                data,
                range: max_abs,
            }
        }
        QuantMode::Bin => {
            let mut bits = vec![0u8; unit.len().div_ceil(8)];
            for (i, &x) in unit.iter().enumerate() {
                if x > 0.0 {
                    bits[i / 8] |= 1 << (i % 8);
                }
            }
            StoredVector::Bin {
                bits,
                dim: unit.len(),
            }
        }
    }
}

/// Inverse of [`quantize`], up to quantization error. Binary vectors come
/// back as `±1/sqrt(dim)` so the result is still unit length.
pub fn dequantize(stored: &StoredVector) -> Vec<f32> {
    match stored {
        StoredVector::F32(v) => v.clone(),
        StoredVector::Q8 { data, range } => {
            let scale = range / 127.0;
            data.iter().map(|&q| q as f32 * scale).collect()
        }
        StoredVector::Bin { bits, dim } => {
            let unit = 1.0 / ((*dim).max(1) as f32).sqrt();
            (0..*dim)
                .map(|i| {
                    if bits[i / 8] & (1 << (i % 8)) != 0 {
                        unit
                    } else {
                        -unit
                    }
                })
                .collect()
        }
    }
}

/// Cosine distance between two unit vectors in the same representation,
/// in the range 0 (identical) to 2 (opposite).
pub fn distance(a: &StoredVector, b: &StoredVector) -> f32 {
    let d = match (a, b) {
        (StoredVector::F32(x), StoredVector::F32(y)) => 1.0 - dot_f32(x, y, true),
        (StoredVector::Q8 { data: x, range: rx }, StoredVector::Q8 { data: y, range: ry }) => {
            let raw = dot_i8(x, y, true) as f32;
            1.0 - raw * (rx / 127.0) * (ry / 127.0)
        }
        (StoredVector::Bin { bits: x, dim }, StoredVector::Bin { bits: y, .. }) => {
            let differing: u32 = x.iter().zip(y).map(|(a, b)| (a ^ b).count_ones()).sum();
            2.0 * differing as f32 / (*dim).max(1) as f32
        }
        _ => 2.0,
    };
    d.clamp(0.0, 2.0)
}

#[inline]
pub fn dot_f32(a: &[f32], b: &[f32], simd_enabled: bool) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if simd_enabled {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx2") && a.len() >= 8 {
                unsafe {
                    return dot_f32_avx2(a, b);
                }
            }
        }
    }
    dot_f32_scalar(a, b)
}

#[inline]
fn dot_f32_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn dot_i8(a: &[i8], b: &[i8], simd_enabled: bool) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    if simd_enabled {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx2") && a.len() >= 32 {
                unsafe {
                    return dot_i8_avx2(a, b);
                }
            }
        }
    }
    dot_i8_scalar(a, b)
}

fn dot_i8_scalar(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as i32) * (*y as i32))
        .sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_i8_avx2(a: &[i8], b: &[i8]) -> i32 {
    use std::arch::x86_64::*;

    let mut sum = _mm256_setzero_si256();
    let ones = _mm256_set1_epi16(1);
    let mut i = 0usize;
    while i + 32 <= a.len() {
        let va = _mm256_loadu_si256(a.as_ptr().add(i) as *const __m256i);
        let vb = _mm256_loadu_si256(b.as_ptr().add(i) as *const __m256i);

        let va_lo = _mm256_cvtepi8_epi16(_mm256_castsi256_si128(va));
        let vb_lo = _mm256_cvtepi8_epi16(_mm256_castsi256_si128(vb));
        let va_hi = _mm256_cvtepi8_epi16(_mm256_extracti128_si256(va, 1));
        let vb_hi = _mm256_cvtepi8_epi16(_mm256_extracti128_si256(vb, 1));

        // products of two int8 fit in i16; madd widens pairs into i32
        let acc_lo = _mm256_madd_epi16(_mm256_mullo_epi16(va_lo, vb_lo), ones);
        let acc_hi = _mm256_madd_epi16(_mm256_mullo_epi16(va_hi, vb_hi), ones);
        sum = _mm256_add_epi32(sum, acc_lo);
        sum = _mm256_add_epi32(sum, acc_hi);
        i += 32;
    }
    let mut tmp = [0i32; 8];
    _mm256_storeu_si256(tmp.as_mut_ptr() as *mut __m256i, sum);
    let mut acc = tmp.iter().sum::<i32>();
    while i < a.len() {
        acc += (a[i] as i32) * (b[i] as i32);
        i += 1;
    }
    acc
}
