/// Loudness matching around the cascade — block RMS tracking plus a
/// smoothed decibel correction.
///
/// The cascade's makeup-gain laws only roughly level-match across the drive
/// range, so the engine measures RMS before and after distortion and walks
/// a correction toward `20*log10(in/out)` dB. The correction target updates
/// once per block; the applied gain moves along a short linear ramp per
/// sample, trading a fixed 1 ms control lag for the absence of audible gain
/// steps at block boundaries.
///
/// Silence handling: below the input threshold no new target is set — the
/// ramp keeps converging to the last valid correction instead of hunting on
/// a meaningless in/out ratio.

/// Input RMS floor below which the correction target is left alone (~-80 dB).
const SILENCE_THRESHOLD: f64 = 0.001;
/// Guards the in/out ratio against division by zero.
const RMS_EPSILON: f64 = 1e-12;
/// Correction applied before the first measurement settles.
const INITIAL_CORRECTION_DB: f64 = -12.0;
/// Ramp time for the per-sample gain walk.
const RAMP_SECONDS: f64 = 0.001;

/// Fixed-rate linear ramp toward a target value. No allocation; step and
/// remaining-count are recomputed on retarget only.
pub struct LinearSmoother {
    current: f64,
    target: f64,
    step: f64,
    remaining: u32,
    ramp_samples: u32,
}

impl LinearSmoother {
    pub fn new(ramp_seconds: f64, sample_rate: f64) -> Self {
        Self {
            current: 0.0,
            target: 0.0,
            step: 0.0,
            remaining: 0,
            ramp_samples: ((ramp_seconds * sample_rate) as u32).max(1),
        }
    }

    /// Jump to a value with no ramp (prepare/reset).
    pub fn snap_to(&mut self, value: f64) {
        self.current = value;
        self.target = value;
        self.remaining = 0;
    }

    /// Start ramping toward a new target from the current position.
    pub fn set_target(&mut self, target: f64) {
        if target == self.target {
            return;
        }
        self.target = target;
        self.step = (target - self.current) / self.ramp_samples as f64;
        self.remaining = self.ramp_samples;
    }

    /// Advance one sample and return the new current value.
    pub fn next(&mut self) -> f64 {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            } else {
                self.current += self.step;
            }
        }
        self.current
    }

    pub fn current(&self) -> f64 {
        self.current
    }
}

pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db * 0.05)
}

pub fn gain_to_db(gain: f64) -> f64 {
    20.0 * gain.max(RMS_EPSILON).log10()
}

/// Pre/post RMS tracker with the smoothed correction ramp.
pub struct AutoGain {
    correction_db: LinearSmoother,
    last_input_rms: f64,
    last_output_rms: f64,
}

impl AutoGain {
    pub fn new(sample_rate: f64) -> Self {
        let mut correction_db = LinearSmoother::new(RAMP_SECONDS, sample_rate);
        correction_db.snap_to(INITIAL_CORRECTION_DB);
        Self {
            correction_db,
            last_input_rms: 0.0,
            last_output_rms: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.correction_db.snap_to(INITIAL_CORRECTION_DB);
        self.last_input_rms = 0.0;
        self.last_output_rms = 0.0;
    }

    /// Measure the pre-distortion block (all channels pooled).
    pub fn measure_input(&mut self, block: &[&mut [f64]], num_samples: usize) {
        self.last_input_rms = block_rms(block, num_samples);
    }

    /// Measure the post-distortion block, update the correction target, and
    /// apply the ramped gain in place.
    pub fn process(&mut self, block: &mut [&mut [f64]], num_samples: usize) {
        self.last_output_rms = block_rms(block, num_samples);

        if self.last_input_rms > SILENCE_THRESHOLD {
            let ratio = (self.last_input_rms + RMS_EPSILON) / (self.last_output_rms + RMS_EPSILON);
            self.correction_db.set_target(20.0 * ratio.log10());
        }

        for i in 0..num_samples {
            let gain = db_to_gain(self.correction_db.next());
            for channel in block.iter_mut() {
                channel[i] *= gain;
            }
        }
    }

    pub fn last_input_rms(&self) -> f64 {
        self.last_input_rms
    }

    pub fn last_output_rms(&self) -> f64 {
        self.last_output_rms
    }

    /// Correction currently applied, in dB.
    pub fn correction_db(&self) -> f64 {
        self.correction_db.current()
    }
}

fn block_rms(block: &[&mut [f64]], num_samples: usize) -> f64 {
    if block.is_empty() || num_samples == 0 {
        return 0.0;
    }
    let mut sum_squares = 0.0;
    for channel in block {
        for &sample in &channel[..num_samples] {
            sum_squares += sample * sample;
        }
    }
    (sum_squares / (num_samples * block.len()) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_refs(bufs: &mut [Vec<f64>]) -> Vec<&mut [f64]> {
        bufs.iter_mut().map(|b| b.as_mut_slice()).collect()
    }

    #[test]
    fn test_smoother_reaches_target_linearly() {
        let mut sm = LinearSmoother::new(0.001, 1000.0); // 1-sample ramp
        sm.snap_to(0.0);
        sm.set_target(6.0);
        assert_eq!(sm.next(), 6.0);
        assert_eq!(sm.next(), 6.0);

        let mut sm = LinearSmoother::new(0.004, 1000.0); // 4-sample ramp
        sm.snap_to(0.0);
        sm.set_target(4.0);
        let steps: Vec<f64> = (0..5).map(|_| sm.next()).collect();
        assert_eq!(steps, vec![1.0, 2.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn test_autogain_matches_rms_on_attenuated_block() {
        let sr = 44100.0;
        let mut ag = AutoGain::new(sr);

        // "Distortion" that just drops the level 6 dB: input 0.5, output 0.25.
        // Process enough blocks for the 1 ms ramp and the target update to
        // settle (target is computed from the pre-gain output of each block).
        let mut out_rms = 0.0;
        for _ in 0..4 {
            let mut input = vec![vec![0.5f64; 512]];
            ag.measure_input(&as_refs(&mut input), 512);
            let mut output = vec![vec![0.25f64; 512]];
            let mut refs = as_refs(&mut output);
            ag.process(&mut refs, 512);
            out_rms = block_rms(&refs, 512);
        }

        let err_db = (gain_to_db(out_rms) - gain_to_db(0.5)).abs();
        assert!(err_db < 0.5, "corrected RMS should match input: {err_db:.2} dB off");
    }

    #[test]
    fn test_silence_does_not_retarget() {
        let sr = 44100.0;
        let mut ag = AutoGain::new(sr);

        // Establish a +6 dB correction on real signal.
        for _ in 0..4 {
            let mut loud = vec![vec![0.5f64; 256]];
            ag.measure_input(&as_refs(&mut loud), 256);
            let mut out = vec![vec![0.25f64; 256]];
            let mut refs = as_refs(&mut out);
            ag.process(&mut refs, 256);
        }
        let settled = ag.correction_db();
        assert!((settled - 6.0).abs() < 0.5, "expected ~+6 dB, got {settled:.2}");

        // Silence: the in/out ratio is meaningless, target must hold.
        let mut silent = vec![vec![0.0f64; 256]];
        ag.measure_input(&as_refs(&mut silent), 256);
        let mut out = vec![vec![0.0f64; 256]];
        let mut refs = as_refs(&mut out);
        ag.process(&mut refs, 256);
        assert!(
            (ag.correction_db() - settled).abs() < 1e-9,
            "correction moved on silence: {} -> {}",
            settled,
            ag.correction_db()
        );
    }

    #[test]
    fn test_initial_correction_applied_from_first_sample() {
        let sr = 44100.0;
        let mut ag = AutoGain::new(sr);

        // Below-threshold input: no retarget, so the initial -12 dB holds.
        let mut quiet = vec![vec![0.0005f64; 64]];
        ag.measure_input(&as_refs(&mut quiet), 64);
        let mut refs = as_refs(&mut quiet);
        ag.process(&mut refs, 64);

        let expected = 0.0005 * db_to_gain(-12.0);
        assert!(
            (quiet[0][0] - expected).abs() < 1e-12,
            "expected initial -12 dB: {} vs {expected}",
            quiet[0][0]
        );
    }

    #[test]
    fn test_db_gain_roundtrip() {
        for db in [-24.0, -6.0, 0.0, 6.0, 12.0] {
            let back = gain_to_db(db_to_gain(db));
            assert!((back - db).abs() < 1e-9, "{db} dB roundtrip gave {back}");
        }
    }
}
