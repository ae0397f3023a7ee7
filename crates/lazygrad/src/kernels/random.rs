//! Random tensor construction.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;

use crate::dense::DenseTensor;
use crate::shape::numel;

/// Uniform values in `[low, high)`.
///
/// # Example
///
/// ```
/// use lazygrad::kernels::random_uniform;
/// use rand::SeedableRng;
/// use rand::rngs::StdRng;
///
/// let t1 = random_uniform(&[2, 3], 0.0, 1.0, &mut StdRng::seed_from_u64(42));
/// let t2 = random_uniform(&[2, 3], 0.0, 1.0, &mut StdRng::seed_from_u64(42));
/// assert_eq!(t1.data(), t2.data());
/// assert!(t1.data().iter().all(|&v| (0.0..1.0).contains(&v)));
/// ```
pub fn random_uniform<R: Rng>(shape: &[usize], low: f64, high: f64, rng: &mut R) -> DenseTensor {
    let data = (0..numel(shape))
        .map(|_| {
            let u: f64 = rng.sample(StandardUniform);
            low + (high - low) * u
        })
        .collect();
    DenseTensor::from_parts(data, shape)
}

/// Normal values with the given mean and standard deviation.
pub fn random_normal<R: Rng>(shape: &[usize], mean: f64, std: f64, rng: &mut R) -> DenseTensor {
    let data = (0..numel(shape))
        .map(|_| {
            let z: f64 = rng.sample(StandardNormal);
            mean + std * z
        })
        .collect();
    DenseTensor::from_parts(data, shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_uniform_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = random_uniform(&[100], -2.0, 3.0, &mut rng);
        assert!(t.data().iter().all(|&v| (-2.0..3.0).contains(&v)));
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = StdRng::seed_from_u64(11);
        let t = random_normal(&[10_000], 1.0, 2.0, &mut rng);
        let mean = t.data().iter().sum::<f64>() / t.len() as f64;
        assert!((mean - 1.0).abs() < 0.1);
    }
}
