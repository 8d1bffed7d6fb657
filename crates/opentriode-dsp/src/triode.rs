/// Single triode gain stage — Koren plate-voltage solver with warm-started
/// Newton-Raphson and per-channel continuation.
///
/// Device law (Koren normalized form):
///   Ip = G * ln(1 + e^x)^P,   x = (Vgk + Vp/mu) / C
///
/// The plate hangs off the supply through the plate load resistor, so the
/// operating point satisfies the implicit equation
///   f(Vp) = (Vp - B_plus) + Rp * Ip(Vp) = 0
/// solved per sample by Newton-Raphson. The soft-plus term ln(1 + e^x) is
/// computed directly (exp + ln_1p); its derivative is the logistic
/// e^x / (1 + e^x).
///
/// Each channel carries the previous sample's converged Vp as the next
/// sample's initial guess. The physical plate voltage is continuous between
/// samples, so the warm start typically converges in 1-2 iterations and
/// avoids the discontinuities a cold start from B_plus would inject.
///
/// Divergence handling: a non-finite Newton update aborts the iteration and
/// keeps the last finite Vp. Running out of iterations is not an error —
/// the best available estimate is used.

/// Per-stage configuration: gain/bias/drive laws plus the Koren device
/// constants. Five hand-tuned instances encode the cascade topology; the
/// constants are voicing data fit to a specific amp, not derived values.
#[derive(Clone, Copy)]
pub struct StageParams {
    /// Fixed makeup gain; the solved Vp is written back as Vp * gain_eff/300,
    /// which folds the plate-voltage domain back into audio amplitude.
    pub gain: f64,
    /// Drive-tracking makeup gain: gain_eff = gain + gain_per_drive * drive.
    pub gain_per_drive: f64,
    /// Grid bias in volts per unit of the global bias control. Alternating
    /// signs across the cascade give the asymmetric stage-to-stage biasing.
    pub bias_scale: f64,
    /// Grid drive per unit of the global drive control:
    /// Vgk = sample * (1 + drive_slope * drive) + bias_scale * bias.
    pub drive_slope: f64,
    /// Koren transconductance scale G.
    pub g: f64,
    /// Amplification factor mu.
    pub mu: f64,
    /// Knee-softness constant C.
    pub c: f64,
    /// Current-law exponent P.
    pub p: f64,
    /// Plate supply voltage B+ (also the cold continuation seed).
    pub b_plus: f64,
    /// Plate load resistance (ohms).
    pub rp: f64,
    /// Newton iteration cap — bounds worst-case per-sample cost.
    pub max_iter: u32,
    /// Early-exit residual tolerance on |f(Vp)|.
    pub tol: f64,
}

impl StageParams {
    /// Stage 1 — 12AX7 input stage. Fixed low makeup gain, no bias offset,
    /// steepest drive slope (this stage does most of the waveshaping).
    pub fn stage1_12ax7() -> Self {
        Self {
            gain: 0.3,
            gain_per_drive: 0.0,
            bias_scale: 0.0,
            drive_slope: 60.0,
            g: 2.5e-3,
            mu: 100.0,
            c: 0.5,
            p: 1.5,
            b_plus: 200.0,
            rp: 130_000.0,
            max_iter: 8,
            tol: 1e-5,
        }
    }

    /// Stage 2 — 12AX7, positively biased.
    pub fn stage2_12ax7() -> Self {
        Self {
            gain: 0.3,
            gain_per_drive: 0.0,
            bias_scale: 1.25,
            drive_slope: 40.0,
            g: 2.5e-3,
            mu: 100.0,
            c: 0.5,
            p: 1.5,
            b_plus: 300.0,
            rp: 200_000.0,
            max_iter: 8,
            tol: 1e-5,
        }
    }

    /// Stage 3 — 12AT7, negatively biased; makeup gain tracks the drive
    /// control so this stage opens up as the cascade is pushed.
    pub fn stage3_12at7() -> Self {
        Self {
            gain: 0.0,
            gain_per_drive: 0.65,
            bias_scale: -1.35,
            drive_slope: 30.0,
            g: 3.5e-3,
            mu: 60.0,
            c: 0.5,
            p: 1.5,
            b_plus: 350.0,
            rp: 160_000.0,
            max_iter: 8,
            tol: 1e-5,
        }
    }

    /// Stage 4 — 12AT7, positively biased, drive-tracking makeup gain.
    pub fn stage4_12at7() -> Self {
        Self {
            gain: 0.0,
            gain_per_drive: 0.55,
            bias_scale: 1.5,
            drive_slope: 30.0,
            g: 3.5e-3,
            mu: 60.0,
            c: 0.5,
            p: 1.5,
            b_plus: 400.0,
            rp: 120_000.0,
            max_iter: 8,
            tol: 1e-5,
        }
    }

    /// Stage 5 — 12AU7 output stage. Low mu, highest transconductance,
    /// gentlest drive slope.
    pub fn stage5_12au7() -> Self {
        Self {
            gain: 0.5,
            gain_per_drive: 0.0,
            bias_scale: -1.25,
            drive_slope: 20.0,
            g: 7.0e-3,
            mu: 17.0,
            c: 0.5,
            p: 1.5,
            b_plus: 400.0,
            rp: 150_000.0,
            max_iter: 8,
            tol: 1e-5,
        }
    }

    /// Solve f(Vp) = (Vp - B_plus) + Rp * G * ln(1 + e^x)^P = 0 for Vp.
    ///
    /// Newton-Raphson from `vp_init`. Always returns a finite value when
    /// given a finite seed: overflowing intermediates (adversarially large
    /// Vgk drives e^x to infinity and the derivative to NaN) abort the
    /// iteration before the non-finite update is committed.
    pub fn solve_vp(&self, vgk: f64, vp_init: f64) -> f64 {
        let mut vp = vp_init;
        let inv_mu = 1.0 / self.mu;
        let inv_c = 1.0 / self.c;

        for _ in 0..self.max_iter {
            let x = (vgk + vp * inv_mu) * inv_c;
            let ex = x.exp();
            let softplus = ex.ln_1p();
            let softplus_p = softplus.powf(self.p);
            let ip = self.g * softplus_p;

            let f = (vp - self.b_plus) + ip * self.rp;
            if f.abs() < self.tol {
                break;
            }

            // Analytic derivative: d/dVp ln(1+e^x) = logistic(x) / (C * mu),
            // softplus^(P-1) recovered from the already-computed power.
            let logistic = ex / (1.0 + ex);
            let softplus_pm1 = if softplus > 1e-12 { softplus_p / softplus } else { 0.0 };
            let dip_dvp = self.g * self.p * softplus_pm1 * logistic * inv_c * inv_mu;
            let df_dvp = 1.0 + self.rp * dip_dvp;

            let vp_next = vp - f / df_dvp;
            if !vp_next.is_finite() {
                break;
            }
            vp = vp_next;
        }

        vp
    }
}

/// One cascade position: device constants plus the per-channel continuation
/// seed (last converged plate voltage, carried across samples AND blocks).
pub struct TriodeStage {
    params: StageParams,
    seeds: Vec<f64>,
}

impl TriodeStage {
    pub fn new(params: StageParams, num_channels: usize) -> Self {
        Self {
            seeds: vec![params.b_plus; num_channels],
            params,
        }
    }

    /// Reseed every channel from B+ (cold start). Called on engine reset.
    pub fn reset(&mut self) {
        for seed in &mut self.seeds {
            *seed = self.params.b_plus;
        }
    }

    /// Run the stage over an oversampled block in place.
    ///
    /// `drive` and `bias` are the block's control snapshot; the stage maps
    /// them through its own laws (drive_slope, bias_scale, gain_per_drive).
    pub fn process_block(&mut self, block: &mut [Vec<f64>], num_samples: usize, drive: f64, bias: f64) {
        let drive_amt = 1.0 + self.params.drive_slope * drive;
        let bias_volts = self.params.bias_scale * bias;
        let scale = (self.params.gain + self.params.gain_per_drive * drive) / 300.0;

        for (seed, channel) in self.seeds.iter_mut().zip(block.iter_mut()) {
            let mut vp = *seed;
            for sample in &mut channel[..num_samples] {
                let vgk = *sample * drive_amt + bias_volts;
                vp = self.params.solve_vp(vgk, vp);
                *sample = vp * scale;
            }
            *seed = vp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_solver_converges_to_tolerance() {
        let params = StageParams::stage1_12ax7();
        let vp = params.solve_vp(0.0, params.b_plus);

        // Residual at the returned root should satisfy the tolerance (the
        // warm basin around B+ converges well inside 8 iterations).
        let x = (0.0 + vp / params.mu) / params.c;
        let ip = params.g * x.exp().ln_1p().powf(params.p);
        let f = (vp - params.b_plus) + ip * params.rp;
        assert!(f.abs() < 1e-3, "residual too large: {f:.2e} at vp={vp:.4}");
    }

    #[test]
    fn test_solver_seed_independent_within_basin() {
        // Seeds within +/-50% of B+ must land on the same root.
        let mut params = StageParams::stage2_12ax7();
        params.max_iter = 32; // cold starts need more than the RT cap

        let root_mid = params.solve_vp(-0.5, params.b_plus);
        let root_low = params.solve_vp(-0.5, params.b_plus * 0.5);
        let root_high = params.solve_vp(-0.5, params.b_plus * 1.5);

        assert!(
            (root_low - root_mid).abs() < 1e-3,
            "low seed diverged: {root_low} vs {root_mid}"
        );
        assert!(
            (root_high - root_mid).abs() < 1e-3,
            "high seed diverged: {root_high} vs {root_mid}"
        );
    }

    #[test]
    fn test_solver_warm_start_is_fast_path() {
        let params = StageParams::stage1_12ax7();
        let root = {
            let mut p = params;
            p.max_iter = 32;
            p.solve_vp(0.1, params.b_plus)
        };

        // Restarting at the root with a single allowed iteration must stay
        // at the root (the early-exit residual check fires immediately).
        let mut one_shot = params;
        one_shot.max_iter = 1;
        let again = one_shot.solve_vp(0.1, root);
        assert!((again - root).abs() < 1e-6, "warm restart moved: {again} vs {root}");
    }

    #[test]
    fn test_overflow_guard_keeps_vp_finite() {
        let params = StageParams::stage1_12ax7();

        // e^x overflows to infinity for x this large; the logistic turns
        // NaN and the update must be rejected, not committed.
        for vgk in [1e6, 1e12, f64::MAX / 1e3] {
            let vp = params.solve_vp(vgk, params.b_plus);
            assert!(vp.is_finite(), "vp not finite for vgk={vgk:e}: {vp}");
        }
    }

    #[test]
    fn test_stage_seeds_survive_adversarial_input() {
        let mut stage = TriodeStage::new(StageParams::stage3_12at7(), 2);
        let mut block = vec![vec![1e15f64; 64], vec![-1e15f64; 64]];
        stage.process_block(&mut block, 64, 1.0, 2.0);

        for channel in &block {
            for &s in channel {
                assert!(s.is_finite(), "stage emitted non-finite sample: {s}");
            }
        }
        // A second, sane block must still be processable (seeds intact).
        let mut sane = vec![vec![0.01f64; 64], vec![0.01f64; 64]];
        stage.process_block(&mut sane, 64, 0.5, 0.0);
        assert!(sane[0][63].is_finite());
    }

    #[test]
    fn test_continuation_across_blocks() {
        // Feeding a constant signal in two consecutive blocks must not
        // produce a discontinuity at the block boundary: the second block's
        // first output equals the first block's last output.
        let mut stage = TriodeStage::new(StageParams::stage1_12ax7(), 1);

        let mut block_a = vec![vec![0.02f64; 128]];
        stage.process_block(&mut block_a, 128, 0.6, 0.0);
        let tail = block_a[0][127];

        let mut block_b = vec![vec![0.02f64; 128]];
        stage.process_block(&mut block_b, 128, 0.6, 0.0);
        let head = block_b[0][0];

        assert!(
            (head - tail).abs() < 1e-9,
            "block boundary discontinuity: {tail} -> {head}"
        );
    }

    #[test]
    fn test_stage_distorts_asymmetrically() {
        // The exponential current law produces even harmonics on a sine.
        let sr = 88200.0;
        let freq = 440.0;
        let mut stage = TriodeStage::new(StageParams::stage1_12ax7(), 1);

        let n = (sr * 0.2) as usize;
        let mut block = vec![vec![0.0f64; n]];
        for i in 0..n {
            block[0][i] = 0.1 * (2.0 * PI * freq * i as f64 / sr).sin();
        }
        stage.process_block(&mut block, n, 0.6, 0.0);

        let start = n * 3 / 4;
        let h1 = dft_magnitude(&block[0][start..], freq, sr);
        let h2 = dft_magnitude(&block[0][start..], 2.0 * freq, sr);

        assert!(h1 > 0.0, "no fundamental came through");
        assert!(
            h2 / h1 > 1e-4,
            "expected measurable H2 from the asymmetric transfer: {:.2e}",
            h2 / h1
        );
    }

    fn dft_magnitude(signal: &[f64], freq: f64, sr: f64) -> f64 {
        let n = signal.len() as f64;
        let mut re = 0.0;
        let mut im = 0.0;
        for (i, &s) in signal.iter().enumerate() {
            let phase = 2.0 * PI * freq * i as f64 / sr;
            re += s * phase.cos();
            im -= s * phase.sin();
        }
        ((re / n).powi(2) + (im / n).powi(2)).sqrt()
    }
}
