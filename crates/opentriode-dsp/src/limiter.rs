/// Brickwall safety clamp to [-1, 1].
///
/// Not a mastering limiter: no lookahead, no knee, no release. It runs
/// after the auto-gain correction so a large correction ramp can never
/// push the output past full scale unnoticed.
pub struct Limiter;

impl Limiter {
    pub fn new() -> Self {
        Self
    }

    pub fn process_block(&self, block: &mut [&mut [f64]], num_samples: usize) {
        for channel in block.iter_mut() {
            for sample in &mut channel[..num_samples] {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}
