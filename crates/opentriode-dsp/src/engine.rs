/// Block-processing engine — the host-facing entry point.
///
/// Owns the whole wet path and runs it in fixed order per block:
///
///   dry copy -> input RMS -> oversample up -> triode cascade
///   -> oversample down -> auto-gain -> limiter -> wet/dry mix
///
/// Exactly three calls matter to a host adapter: `prepare` (or `new`),
/// `reset`, and `process`. Everything is preallocated in `prepare`; the
/// per-block path never allocates, locks, or panics in release builds.
/// Control values (drive/bias/mix) arrive as plain scalars — the host
/// adapter snapshots its parameter atomics once per block and passes the
/// values through, so nothing can tear mid-block.
///
/// `prepare` and `reset` must not race a `process` call; the host stops
/// the stream first (standard plugin lifecycle).

use crate::cascade::TriodeCascade;
use crate::level::AutoGain;
use crate::limiter::Limiter;
use crate::oversampler::Oversampler;

/// Stream configuration, fixed between `prepare` calls.
#[derive(Clone, Copy, Debug)]
pub struct ProcessSpec {
    pub sample_rate: f64,
    pub max_block_size: usize,
    pub num_channels: usize,
}

pub struct TriodeEngine {
    spec: ProcessSpec,
    oversampling_factor: usize,
    /// Pre-distortion copy for the wet/dry blend.
    dry: Vec<Vec<f64>>,
    oversampler: Oversampler,
    cascade: TriodeCascade,
    auto_gain: AutoGain,
    limiter: Limiter,
}

impl TriodeEngine {
    /// Allocate the full signal chain for a stream configuration.
    /// `oversampling_factor` is 1, 2, or 4 (see `Oversampler`).
    pub fn new(spec: ProcessSpec, oversampling_factor: usize) -> Self {
        debug_assert!(spec.sample_rate > 0.0, "invalid sample rate");
        debug_assert!(spec.max_block_size > 0, "invalid block size");
        debug_assert!(spec.num_channels > 0, "invalid channel count");

        let os_rate = spec.sample_rate * oversampling_factor as f64;
        Self {
            spec,
            oversampling_factor,
            dry: (0..spec.num_channels)
                .map(|_| vec![0.0; spec.max_block_size])
                .collect(),
            oversampler: Oversampler::new(spec.num_channels, spec.max_block_size, oversampling_factor),
            cascade: TriodeCascade::new(os_rate, spec.num_channels),
            auto_gain: AutoGain::new(spec.sample_rate),
            limiter: Limiter::new(),
        }
    }

    /// Reconfigure for a new stream spec. Reallocates; never call while a
    /// `process` call is in flight.
    pub fn prepare(&mut self, spec: ProcessSpec, oversampling_factor: usize) {
        *self = Self::new(spec, oversampling_factor);
    }

    /// Reinitialize all solver continuation and filter state without
    /// reallocating. Call between prepare and the first block, or whenever
    /// a discontinuity is acceptable (playback stop).
    pub fn reset(&mut self) {
        self.cascade.reset();
        self.oversampler.reset();
        self.auto_gain.reset();
    }

    pub fn spec(&self) -> ProcessSpec {
        self.spec
    }

    /// Input RMS of the last processed block (pre-distortion).
    pub fn last_input_rms(&self) -> f64 {
        self.auto_gain.last_input_rms()
    }

    /// Auto-gain correction currently applied, in dB.
    pub fn correction_db(&self) -> f64 {
        self.auto_gain.correction_db()
    }

    /// Run one block in place. `buffer` is channels x samples, at most
    /// `max_block_size` samples; `mix` in [0, 1] blends dry (0) to fully
    /// processed (1).
    pub fn process(&mut self, buffer: &mut [&mut [f64]], drive: f64, bias: f64, mix: f64) {
        let num_samples = buffer.first().map_or(0, |ch| ch.len());
        debug_assert_eq!(buffer.len(), self.spec.num_channels, "channel count mismatch");
        debug_assert!(num_samples <= self.spec.max_block_size, "block exceeds prepared size");
        debug_assert!(buffer.iter().all(|ch| ch.len() == num_samples));

        for (dry, channel) in self.dry.iter_mut().zip(buffer.iter()) {
            dry[..num_samples].copy_from_slice(&channel[..num_samples]);
        }

        self.auto_gain.measure_input(buffer, num_samples);

        self.oversampler.process_up(buffer, num_samples);
        let os_samples = num_samples * self.oversampling_factor;
        self.cascade
            .process_block(self.oversampler.block_mut(), os_samples, drive, bias);
        self.oversampler.process_down(buffer, num_samples);

        self.auto_gain.process(buffer, num_samples);
        self.limiter.process_block(buffer, num_samples);

        let wet_gain = mix;
        let dry_gain = 1.0 - mix;
        for (channel, dry) in buffer.iter_mut().zip(self.dry.iter()) {
            for (sample, &dry_sample) in channel[..num_samples].iter_mut().zip(&dry[..num_samples]) {
                *sample = wet_gain * *sample + dry_gain * dry_sample;
            }
        }
    }
}

/// Encode an L/R buffer to mid/side in place: M = (L+R)/2, S = (L-R)/2.
///
/// Not wired into `process` — the engine runs plain L/R. Kept as a pipeline
/// capability for host adapters that want to distort mid and side
/// separately. No-op on mono buffers.
pub fn encode_mid_side(buffer: &mut [&mut [f64]]) {
    if buffer.len() < 2 {
        return;
    }
    let (left, right) = buffer.split_at_mut(1);
    for (l, r) in left[0].iter_mut().zip(right[0].iter_mut()) {
        let mid = 0.5 * (*l + *r);
        let side = 0.5 * (*l - *r);
        *l = mid;
        *r = side;
    }
}

/// Decode a mid/side buffer back to L/R in place: L = M+S, R = M-S.
pub fn decode_mid_side(buffer: &mut [&mut [f64]]) {
    if buffer.len() < 2 {
        return;
    }
    let (mid, side) = buffer.split_at_mut(1);
    for (m, s) in mid[0].iter_mut().zip(side[0].iter_mut()) {
        let left = *m + *s;
        let right = *m - *s;
        *m = left;
        *s = right;
    }
}
