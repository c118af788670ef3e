use rand::Rng;

use super::VsetError;

/// Random Gaussian projection from `input_dim` down to `output_dim`.
/// Stored row-major: one row of `input_dim` weights per output component.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    input_dim: usize,
    output_dim: usize,
    matrix: Vec<f32>,
}

impl Projection {
    pub fn random(input_dim: usize, output_dim: usize) -> Self {
        Self::random_with_rng(input_dim, output_dim, &mut rand::thread_rng())
    }

    pub fn random_with_rng<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> Self {
        let scale = 1.0 / (input_dim.max(1) as f32).sqrt();
        let matrix = (0..input_dim * output_dim)
            .map(|_| gaussian(rng) * scale)
            .collect();
        Self {
            input_dim,
            output_dim,
            matrix,
        }
    }

    pub fn from_bytes(input_dim: usize, output_dim: usize, bytes: &[u8]) -> Result<Self, VsetError> {
        let expected = input_dim
            .checked_mul(output_dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| VsetError::Corrupt("projection matrix too large".into()))?;
        if bytes.len() != expected {
            return Err(VsetError::Corrupt(format!(
                "projection matrix has {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let matrix = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            input_dim,
            output_dim,
            matrix,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.matrix.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn matrix(&self) -> &[f32] {
        &self.matrix
    }

    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        debug_assert_eq!(input.len(), self.input_dim);
        self.matrix
            .chunks_exact(self.input_dim.max(1))
            .map(|row| row.iter().zip(input).map(|(w, x)| w * x).sum())
            .collect()
    }
}

/// Box–Muller draw from N(0, 1).
fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}
