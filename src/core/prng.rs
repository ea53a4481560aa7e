// Small seeded generator for kernel initialisation.
//
// Not cryptographically secure. Only used so that `KernelBank::random` is
// reproducible from a seed without pulling in an RNG crate.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
    spare_normal: Option<f32>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // xorshift has a fixed point at zero.
        let state = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self {
            state,
            spare_normal: None,
        }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform sample in the open interval (0, 1).
    #[inline]
    pub fn next_open01(&mut self) -> f32 {
        let bits = (self.next_u64() >> 40) as u32; // 24 bits of mantissa
        (bits as f32 + 0.5) / (1u32 << 24) as f32
    }

    /// Standard normal sample (Box-Muller, second value cached).
    pub fn next_normal(&mut self) -> f32 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }
        let u1 = self.next_open01();
        let u2 = self.next_open01();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = core::f32::consts::TAU * u2;
        self.spare_normal = Some(r * theta.sin());
        r * theta.cos()
    }

    pub fn fill_normal(&mut self, out: &mut [f32]) {
        for x in out {
            *x = self.next_normal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_normal().to_bits(), b.next_normal().to_bits());
        }
    }

    #[test]
    fn open_unit_interval_excludes_endpoints() {
        let mut rng = Prng::new(0);
        for _ in 0..10_000 {
            let u = rng.next_open01();
            assert!(u > 0.0 && u < 1.0);
        }
    }

    #[test]
    fn normal_samples_are_roughly_centred() {
        let mut rng = Prng::new(99);
        let mut buf = vec![0.0f32; 20_000];
        rng.fill_normal(&mut buf);
        let mean = buf.iter().sum::<f32>() / buf.len() as f32;
        let var = buf.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / buf.len() as f32;
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.1, "var = {var}");
    }
}
