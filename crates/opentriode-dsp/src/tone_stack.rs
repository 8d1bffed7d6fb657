/// Three-band tone stack — low shelf, high shelf, mid peak in series.
///
/// Sits between cascade stages 4 and 5, i.e. inside the oversampled block
/// (the tone control of the modeled amp lives mid-circuit, not at the end
/// of the chain). All three bands hang off the single drive control:
///
///   shelf gain (dB)       = SHELF_DB_PER_DRIVE * drive   (both shelves)
///   mid peak gain (linear) = PEAK_GAIN_PER_DRIVE * drive
///
/// The mapping is voicing data fit by ear, not a derived response — treat
/// the constants as configuration.
///
/// Coefficients are recomputed only when drive moves by more than
/// DRIVE_EPSILON since the last recompute; a static control costs nothing
/// per block. Filter state is per channel; coefficients are shared.

use crate::filters::Biquad;

/// Low shelf corner.
const LOW_SHELF_HZ: f64 = 90.0;
/// High shelf corner.
const HIGH_SHELF_HZ: f64 = 14_000.0;
/// Mid peak center.
const MID_PEAK_HZ: f64 = 600.0;
/// Shelf Q (Butterworth).
const SHELF_Q: f64 = 0.707;
/// Mid peak Q.
const MID_PEAK_Q: f64 = 0.7;
/// Shelf boost per unit drive, in dB.
const SHELF_DB_PER_DRIVE: f64 = 3.0;
/// Mid peak linear gain per unit drive.
const PEAK_GAIN_PER_DRIVE: f64 = 1.25;
/// Hysteresis gate for coefficient recomputation.
const DRIVE_EPSILON: f64 = 1e-3;
/// Floor keeping the peak form well-defined as drive approaches zero
/// (the cookbook peak divides by sqrt(gain)).
const MIN_PEAK_GAIN: f64 = 1e-3;

pub struct ToneStack {
    /// One (low, high, peak) triple per channel.
    low_shelves: Vec<Biquad>,
    high_shelves: Vec<Biquad>,
    mid_peaks: Vec<Biquad>,
    /// Oversampled rate the filters run at.
    sample_rate: f64,
    /// Drive value the current coefficients were derived from.
    last_drive: f64,
}

impl ToneStack {
    /// Create a tone stack at the given (oversampled) sample rate.
    /// Coefficients start at the drive=0 voicing; the first `set_drive`
    /// call re-derives them.
    pub fn new(sample_rate: f64, num_channels: usize) -> Self {
        let mut stack = Self {
            low_shelves: Vec::with_capacity(num_channels),
            high_shelves: Vec::with_capacity(num_channels),
            mid_peaks: Vec::with_capacity(num_channels),
            sample_rate,
            last_drive: 0.0,
        };
        let (shelf_lin, peak_lin) = Self::gain_law(0.0);
        for _ in 0..num_channels {
            stack
                .low_shelves
                .push(Biquad::low_shelf(LOW_SHELF_HZ, SHELF_Q, shelf_lin, sample_rate));
            stack
                .high_shelves
                .push(Biquad::high_shelf(HIGH_SHELF_HZ, SHELF_Q, shelf_lin, sample_rate));
            stack
                .mid_peaks
                .push(Biquad::peak(MID_PEAK_HZ, MID_PEAK_Q, peak_lin, sample_rate));
        }
        stack
    }

    fn gain_law(drive: f64) -> (f64, f64) {
        let shelf_lin = 10f64.powf(SHELF_DB_PER_DRIVE * drive / 20.0);
        let peak_lin = (PEAK_GAIN_PER_DRIVE * drive).max(MIN_PEAK_GAIN);
        (shelf_lin, peak_lin)
    }

    /// Apply the block's drive snapshot. Recomputes coefficients only when
    /// the control actually moved (epsilon gate); filter state is kept.
    pub fn set_drive(&mut self, drive: f64) {
        if (drive - self.last_drive).abs() <= DRIVE_EPSILON {
            return;
        }
        self.last_drive = drive;
        self.update_coefficients();
    }

    fn update_coefficients(&mut self) {
        let (shelf_lin, peak_lin) = Self::gain_law(self.last_drive);
        for f in &mut self.low_shelves {
            f.set_low_shelf(LOW_SHELF_HZ, SHELF_Q, shelf_lin, self.sample_rate);
        }
        for f in &mut self.high_shelves {
            f.set_high_shelf(HIGH_SHELF_HZ, SHELF_Q, shelf_lin, self.sample_rate);
        }
        for f in &mut self.mid_peaks {
            f.set_peak(MID_PEAK_HZ, MID_PEAK_Q, peak_lin, self.sample_rate);
        }
    }

    /// Process the oversampled block in place: low shelf -> high shelf ->
    /// mid peak, per sample, every channel.
    pub fn process_block(&mut self, block: &mut [Vec<f64>], num_samples: usize) {
        for (ch, channel) in block.iter_mut().enumerate() {
            let low = &mut self.low_shelves[ch];
            let high = &mut self.high_shelves[ch];
            let peak = &mut self.mid_peaks[ch];
            for sample in &mut channel[..num_samples] {
                let mut x = *sample;
                x = low.process(x);
                x = high.process(x);
                x = peak.process(x);
                *sample = x;
            }
        }
    }

    pub fn reset(&mut self) {
        for f in &mut self.low_shelves {
            f.reset();
        }
        for f in &mut self.high_shelves {
            f.reset();
        }
        for f in &mut self.mid_peaks {
            f.reset();
        }
    }
}
