/// Five-stage triode cascade with the mid-cascade tone stack.
///
/// Signal flow per oversampled block:
///   stage 1 (12AX7) -> stage 2 (12AX7) -> stage 3 (12AT7)
///   -> stage 4 (12AT7) -> tone stack -> stage 5 (12AU7) -> DC block
///
/// The tone stack sits between stages 4 and 5 on purpose: the modeled amp
/// puts its tone network mid-circuit, so the final stage re-shapes the
/// EQ'd signal. The 20 Hz DC block at the end strips the operating-point
/// offset the asymmetric biasing leaves behind.
///
/// The cascade is oversampling-rate-agnostic — it simply processes however
/// many samples the oversampler hands it. Stage ordering and constants are
/// fixed topology data (see `StageParams`), consumed by one generic
/// per-stage loop rather than per-stage code paths.

use crate::filters::DcBlocker;
use crate::tone_stack::ToneStack;
use crate::triode::{StageParams, TriodeStage};

pub struct TriodeCascade {
    stages: [TriodeStage; 5],
    tone_stack: ToneStack,
    dc_blockers: Vec<DcBlocker>,
}

impl TriodeCascade {
    /// Build the fixed topology at the given (oversampled) sample rate.
    pub fn new(os_sample_rate: f64, num_channels: usize) -> Self {
        Self {
            stages: [
                TriodeStage::new(StageParams::stage1_12ax7(), num_channels),
                TriodeStage::new(StageParams::stage2_12ax7(), num_channels),
                TriodeStage::new(StageParams::stage3_12at7(), num_channels),
                TriodeStage::new(StageParams::stage4_12at7(), num_channels),
                TriodeStage::new(StageParams::stage5_12au7(), num_channels),
            ],
            tone_stack: ToneStack::new(os_sample_rate, num_channels),
            dc_blockers: (0..num_channels).map(|_| DcBlocker::new(os_sample_rate)).collect(),
        }
    }

    /// Reseed all continuation state and clear filter memory.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.tone_stack.reset();
        for dc in &mut self.dc_blockers {
            dc.reset();
        }
    }

    /// Process an oversampled block in place with this block's control
    /// snapshot.
    pub fn process_block(&mut self, block: &mut [Vec<f64>], num_samples: usize, drive: f64, bias: f64) {
        for stage in &mut self.stages[..4] {
            stage.process_block(block, num_samples, drive, bias);
        }

        self.tone_stack.set_drive(drive);
        self.tone_stack.process_block(block, num_samples);

        self.stages[4].process_block(block, num_samples, drive, bias);

        for (dc, channel) in self.dc_blockers.iter_mut().zip(block.iter_mut()) {
            for sample in &mut channel[..num_samples] {
                *sample = dc.process(*sample);
            }
        }
    }
}
