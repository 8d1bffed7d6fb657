/// Cascade Bench — triode cascade DSP validation CLI.
///
/// Measures the five-stage cascade through the full engine (oversampling,
/// tone stack, auto-gain, limiter) and prints the numbers a voicing pass
/// cares about.
///
/// Usage:
///   cascade-bench gain [--freq F] [--amplitude A] [--drive D] [--bias B]
///   cascade-bench sweep [--start F1] [--end F2] [--points N] [--drive D] [--csv FILE]
///   cascade-bench harmonics [--freq F] [--amplitude A] [--drive D] [--bias B]
///   cascade-bench autogain [--amplitude A] [--drive D] [--blocks N]
///   cascade-bench render [--freq F] [--amplitude A] [--duration D] [--drive DR]
///                        [--bias B] [--mix M] [--output FILE]

use std::f64::consts::PI;

use opentriode_dsp::engine::{ProcessSpec, TriodeEngine};

const BASE_SR: f64 = 44100.0;
const BLOCK: usize = 512;
const OS_FACTOR: usize = 2;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "gain" => cmd_gain(&args[2..]),
        "sweep" => cmd_sweep(&args[2..]),
        "harmonics" => cmd_harmonics(&args[2..]),
        "autogain" => cmd_autogain(&args[2..]),
        "render" => cmd_render(&args[2..]),
        _ => {
            eprintln!("Unknown subcommand: {}", args[1]);
            print_usage();
        }
    }
}

fn print_usage() {
    eprintln!("Cascade Bench — triode cascade DSP validation");
    eprintln!();
    eprintln!("Subcommands:");
    eprintln!("  gain        Measure engine gain at a single frequency");
    eprintln!("  sweep       Frequency response sweep (log scale)");
    eprintln!("  harmonics   Measure harmonic distortion (H1-H5, THD)");
    eprintln!("  autogain    Auto-gain correction convergence per block");
    eprintln!("  render      Sine -> cascade -> WAV output");
    eprintln!();
    eprintln!("Use --help after any subcommand for options.");
}

fn parse_flag(args: &[String], flag: &str, default: f64) -> f64 {
    for i in 0..args.len().saturating_sub(1) {
        if args[i] == flag {
            return args[i + 1].parse().unwrap_or(default);
        }
    }
    default
}

fn parse_flag_str<'a>(args: &'a [String], flag: &str, default: &'a str) -> &'a str {
    for i in 0..args.len().saturating_sub(1) {
        if args[i] == flag {
            return &args[i + 1];
        }
    }
    default
}

fn make_engine() -> TriodeEngine {
    TriodeEngine::new(
        ProcessSpec {
            sample_rate: BASE_SR,
            max_block_size: BLOCK,
            num_channels: 1,
        },
        OS_FACTOR,
    )
}

/// Run a phase-continuous sine through the engine block by block and
/// return the mono output.
fn process_sine(
    engine: &mut TriodeEngine,
    freq: f64,
    amplitude: f64,
    drive: f64,
    bias: f64,
    mix: f64,
    num_samples: usize,
) -> Vec<f64> {
    let mut output = Vec::with_capacity(num_samples);
    let mut offset = 0usize;
    while offset < num_samples {
        let len = BLOCK.min(num_samples - offset);
        let mut block: Vec<f64> = (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * (offset + i) as f64 / BASE_SR).sin())
            .collect();
        let mut refs: Vec<&mut [f64]> = vec![block.as_mut_slice()];
        engine.process(&mut refs, drive, bias, mix);
        output.extend_from_slice(&block);
        offset += len;
    }
    output
}

// ─── Gain measurement ───────────────────────────────────────────────────────

fn measure_gain_at(freq: f64, amplitude: f64, drive: f64, bias: f64) -> f64 {
    let mut engine = make_engine();

    let n_settle = (BASE_SR * 0.3) as usize;
    let n_measure = (BASE_SR * 0.2) as usize;
    let output = process_sine(&mut engine, freq, amplitude, drive, bias, 1.0, n_settle + n_measure);

    let peak = output[n_settle..].iter().map(|x| x.abs()).fold(0.0f64, f64::max);
    peak / amplitude
}

fn cmd_gain(args: &[String]) {
    let freq = parse_flag(args, "--freq", 1000.0);
    let amplitude = parse_flag(args, "--amplitude", 0.1);
    let drive = parse_flag(args, "--drive", 0.6);
    let bias = parse_flag(args, "--bias", 0.0);

    let gain = measure_gain_at(freq, amplitude, drive, bias);
    let gain_db = 20.0 * gain.log10();

    println!("Cascade gain measurement");
    println!("  Frequency:   {freq:.0} Hz");
    println!("  Amplitude:   {amplitude:.4}");
    println!("  Drive:       {drive:.2}");
    println!("  Bias:        {bias:.2}");
    println!("  Gain:        {gain:.3}x ({gain_db:.2} dB)");
    println!("  Note: auto-gain holds the wet level near the input, so the");
    println!("  steady-state figure should sit within a few dB of 0.");
}

// ─── Frequency sweep ────────────────────────────────────────────────────────

fn cmd_sweep(args: &[String]) {
    let start = parse_flag(args, "--start", 20.0);
    let end = parse_flag(args, "--end", 20000.0);
    let points = parse_flag(args, "--points", 50.0) as usize;
    let drive = parse_flag(args, "--drive", 0.6);
    let amplitude = parse_flag(args, "--amplitude", 0.1);
    let csv_path = parse_flag_str(args, "--csv", "");

    let log_start = start.ln();
    let log_end = end.ln();

    let mut csv_lines = Vec::new();
    csv_lines.push("freq_hz,gain_db".to_string());

    println!("Frequency response sweep (drive = {drive:.2})");
    println!("{:>10}  {:>10}", "Freq (Hz)", "Gain (dB)");
    println!("{:-<10}  {:-<10}", "", "");

    for i in 0..points {
        let frac = i as f64 / (points - 1).max(1) as f64;
        let freq = (log_start + frac * (log_end - log_start)).exp();

        let gain = measure_gain_at(freq, amplitude, drive, 0.0);
        let gain_db = 20.0 * gain.log10();

        println!("{freq:>10.1}  {gain_db:>10.2}");
        csv_lines.push(format!("{freq:.1},{gain_db:.2}"));
    }

    if !csv_path.is_empty() {
        std::fs::write(csv_path, csv_lines.join("\n") + "\n").expect("Failed to write CSV");
        println!("\nCSV written to {csv_path}");
    }
}

// ─── Harmonic analysis ──────────────────────────────────────────────────────

fn cmd_harmonics(args: &[String]) {
    let freq = parse_flag(args, "--freq", 440.0);
    let amplitude = parse_flag(args, "--amplitude", 0.1);
    let drive = parse_flag(args, "--drive", 0.6);
    let bias = parse_flag(args, "--bias", 0.0);

    let mut engine = make_engine();
    let n_total = (BASE_SR * 0.5) as usize;
    let output = process_sine(&mut engine, freq, amplitude, drive, bias, 1.0, n_total);

    // Analyze last quarter (steady state)
    let start = output.len() * 3 / 4;
    let signal = &output[start..];

    let h1 = dft_magnitude(signal, freq, BASE_SR);
    let h2 = dft_magnitude(signal, 2.0 * freq, BASE_SR);
    let h3 = dft_magnitude(signal, 3.0 * freq, BASE_SR);
    let h4 = dft_magnitude(signal, 4.0 * freq, BASE_SR);
    let h5 = dft_magnitude(signal, 5.0 * freq, BASE_SR);

    let thd = ((h2 * h2 + h3 * h3 + h4 * h4 + h5 * h5).sqrt() / h1) * 100.0;

    println!("Harmonic analysis");
    println!("  Frequency:   {freq:.0} Hz");
    println!("  Amplitude:   {amplitude:.4}");
    println!("  Drive:       {drive:.2}   Bias: {bias:.2}");
    println!();
    println!("  H1 (fund):   {h1:.6}");
    println!("  H2:          {h2:.6}  ({:.1} dB rel)", 20.0 * (h2 / h1).log10());
    println!("  H3:          {h3:.6}  ({:.1} dB rel)", 20.0 * (h3 / h1).log10());
    println!("  H4:          {h4:.6}  ({:.1} dB rel)", 20.0 * (h4 / h1).log10());
    println!("  H5:          {h5:.6}  ({:.1} dB rel)", 20.0 * (h5 / h1).log10());
    println!();
    println!("  THD:         {thd:.4}%");
}

// ─── Auto-gain convergence ──────────────────────────────────────────────────

fn cmd_autogain(args: &[String]) {
    let amplitude = parse_flag(args, "--amplitude", 0.1);
    let drive = parse_flag(args, "--drive", 0.6);
    let blocks = parse_flag(args, "--blocks", 20.0) as usize;

    let mut engine = make_engine();

    println!("Auto-gain convergence ({blocks} blocks of {BLOCK} samples)");
    println!("{:>6}  {:>12}  {:>12}  {:>14}", "Block", "In RMS", "Out RMS", "Correction dB");
    println!("{:-<6}  {:-<12}  {:-<12}  {:-<14}", "", "", "", "");

    for block_idx in 0..blocks {
        let offset = block_idx * BLOCK;
        let mut block: Vec<f64> = (0..BLOCK)
            .map(|i| amplitude * (2.0 * PI * 1000.0 * (offset + i) as f64 / BASE_SR).sin())
            .collect();
        let mut refs: Vec<&mut [f64]> = vec![block.as_mut_slice()];
        engine.process(&mut refs, drive, 0.0, 1.0);

        let out_rms = (block.iter().map(|x| x * x).sum::<f64>() / BLOCK as f64).sqrt();
        println!(
            "{block_idx:>6}  {:>12.6}  {out_rms:>12.6}  {:>14.2}",
            engine.last_input_rms(),
            engine.correction_db()
        );
    }
}

// ─── Render (sine -> cascade -> WAV) ────────────────────────────────────────

fn cmd_render(args: &[String]) {
    let freq = parse_flag(args, "--freq", 220.0);
    let amplitude = parse_flag(args, "--amplitude", 0.1);
    let duration = parse_flag(args, "--duration", 2.0);
    let drive = parse_flag(args, "--drive", 0.6);
    let bias = parse_flag(args, "--bias", 0.0);
    let mix = parse_flag(args, "--mix", 1.0);
    let output_path = parse_flag_str(args, "--output", "/tmp/cascade_render.wav");

    let mut engine = make_engine();
    let n_samples = (duration * BASE_SR) as usize;
    let output = process_sine(&mut engine, freq, amplitude, drive, bias, mix, n_samples);

    let peak = output.iter().map(|x| x.abs()).fold(0.0f64, f64::max);
    let peak_dbfs = if peak > 0.0 { 20.0 * peak.log10() } else { -120.0 };

    // Normalize to ~-3 dBFS if the render runs hot
    let scale = if peak > 0.7 { 0.7 / peak } else { 1.0 };

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: BASE_SR as u32,
        bits_per_sample: 24,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, spec).expect("Failed to create WAV file");

    let max_val = (1 << 23) - 1;
    for sample in &output {
        let scaled = (sample * scale * max_val as f64).round() as i32;
        writer.write_sample(scaled.clamp(-max_val, max_val)).unwrap();
    }
    writer.finalize().expect("Failed to finalize WAV file");

    println!("Rendered {duration:.1}s of {freq:.0} Hz at drive {drive:.2}");
    println!("  Peak:        {peak:.4} ({peak_dbfs:.1} dBFS)");
    println!("  Output:      {output_path}");
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
