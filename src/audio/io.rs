use anyhow::{Result, anyhow};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use super::SAMPLE_RATE;
use super::looper::create_engine;
use super::memory::MemoryBank;
use super::mixer::f32_to_sample;
use crate::config::{FootswitchScript, LooperSettings};

/// Read a WAV file as mono 16-bit samples. The engine runs at a fixed rate,
/// so files at any other rate are rejected rather than resampled.
pub fn import_wav<P: AsRef<Path>>(path: P) -> Result<Vec<i16>> {
    let mut reader = WavReader::open(&path)?;
    let spec = reader.spec();

    if spec.sample_rate != SAMPLE_RATE {
        return Err(anyhow!(
            "{} is {} Hz, expected {} Hz",
            path.as_ref().display(),
            spec.sample_rate,
            SAMPLE_RATE
        ));
    }

    let raw_samples: Vec<i16> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f32_to_sample))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            // Scale any integer width to 16 bits
            let shift = spec.bits_per_sample as i32 - 16;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        let scaled = if shift >= 0 { v >> shift } else { v << -shift };
                        scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    // Downmix to mono by averaging channels per frame
    if spec.channels > 1 {
        let ch = spec.channels as usize;
        return Ok(raw_samples
            .chunks(ch)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / ch as i32) as i16)
            .collect());
    }
    Ok(raw_samples)
}

pub fn export_wav<P: AsRef<Path>>(path: P, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(&path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSummary {
    pub samples: usize,
    pub loop_length: usize,
    pub overruns: usize,
}

/// Run `input` through a fresh engine with a scripted footswitch. The
/// background pass runs after every sample, so nothing ever overruns.
pub fn render(
    input: &[i16],
    script: &FootswitchScript,
    settings: &LooperSettings,
) -> (Vec<i16>, RenderSummary) {
    let config = settings.engine_config();
    let switch = script.levels(input.len(), config.sample_rate);
    let bank = MemoryBank::new(config.memory_bytes);
    let (mut engine, mut streaming) = create_engine(config, bank);

    let output: Vec<i16> = input
        .iter()
        .zip(switch)
        .map(|(&x, down)| {
            let y = engine.process(x, down);
            streaming.service();
            y
        })
        .collect();

    let summary = RenderSummary {
        samples: output.len(),
        loop_length: engine.loop_length(),
        overruns: engine.overruns(),
    };
    (output, summary)
}

pub fn render_file<P: AsRef<Path>>(
    input_path: P,
    output_path: P,
    script: &FootswitchScript,
    settings: &LooperSettings,
) -> Result<RenderSummary> {
    let input = import_wav(&input_path)?;
    log::info!(
        "rendering {} samples from {}",
        input.len(),
        input_path.as_ref().display()
    );
    let (output, summary) = render(&input, script, settings);
    export_wav(&output_path, &output, SAMPLE_RATE)?;
    log::info!(
        "wrote {} ({} samples, loop {} samples)",
        output_path.as_ref().display(),
        summary.samples,
        summary.loop_length
    );
    Ok(summary)
}
