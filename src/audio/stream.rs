use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig};
use crossbeam::channel::Sender;
use rtrb::RingBuffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::mixer::{f32_to_sample, sample_to_f32};
use super::{AudioEvent, LooperEngine, SAMPLE_RATE};

/// Input-to-output hand-off, in mono samples (a quarter second).
const INPUT_RING: usize = SAMPLE_RATE as usize / 4;

pub struct AudioStream {
    host: Host,
    input_device: Device,
    output_device: Device,
    input_config: StreamConfig,
    output_config: StreamConfig,
    input_device_name: String,
    output_device_name: String,
}

fn find_device(
    devices: impl Iterator<Item = Device>,
    name: &str,
    kind: &str,
) -> Result<Device> {
    for device in devices {
        if let Ok(device_name) = device.name()
            && device_name == name
        {
            return Ok(device);
        }
    }
    Err(anyhow!("{} device '{}' not found", kind, name))
}

impl AudioStream {
    /// Open the named devices (or the host defaults) at the engine's fixed
    /// sample rate.
    pub fn new(input_device_name: Option<&str>, output_device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();

        let input_device = match input_device_name {
            Some(name) => find_device(host.input_devices()?, name, "Input")?,
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow!("No input device available"))?,
        };
        let output_device = match output_device_name {
            Some(name) => find_device(host.output_devices()?, name, "Output")?,
            None => host
                .default_output_device()
                .ok_or_else(|| anyhow!("No output device available"))?,
        };

        let input_default = input_device.default_input_config()?;
        let output_default = output_device.default_output_config()?;

        let input_device_name = input_device
            .name()
            .unwrap_or_else(|_| "Unknown".to_string());
        let output_device_name = output_device
            .name()
            .unwrap_or_else(|_| "Unknown".to_string());

        log::info!(
            "input device: {} (default {}Hz, {}ch)",
            input_device_name,
            input_default.sample_rate().0,
            input_default.channels()
        );
        log::info!(
            "output device: {} (default {}Hz, {}ch)",
            output_device_name,
            output_default.sample_rate().0,
            output_default.channels()
        );

        // The loop is addressed in samples, so both sides run at the engine rate
        let input_config = StreamConfig {
            channels: input_default.channels(),
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let output_config = StreamConfig {
            channels: output_default.channels(),
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            host,
            input_device,
            output_device,
            input_config,
            output_config,
            input_device_name,
            output_device_name,
        })
    }

    /// Start both streams. The engine moves into the output callback and runs
    /// once per output frame; `footswitch` is sampled at the same rate.
    pub fn start(
        &self,
        mut engine: LooperEngine,
        footswitch: Arc<AtomicBool>,
        events: Sender<AudioEvent>,
    ) -> Result<(Stream, Stream)> {
        let (mut input_tx, mut input_rx) = RingBuffer::<i16>::new(INPUT_RING);
        let input_err_sender = events.clone();
        let output_err_sender = events;

        let input_channels = self.input_config.channels as usize;
        let input_stream = self.input_device.build_input_stream(
            &self.input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(input_channels) {
                    let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                    // the output side has stalled; dropping input is all we can do
                    let _ = input_tx.push(f32_to_sample(mono));
                }
            },
            move |_err| {
                let _ = input_err_sender
                    .try_send(AudioEvent::Error(String::from("Input stream error")));
            },
            None,
        )?;

        let output_channels = self.output_config.channels as usize;
        let output_stream = self.output_device.build_output_stream(
            &self.output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(output_channels) {
                    let input = input_rx.pop().unwrap_or(0);
                    let down = footswitch.load(Ordering::Relaxed);
                    let sample = sample_to_f32(engine.process(input, down));
                    frame.fill(sample);
                }
            },
            move |_err| {
                let _ = output_err_sender
                    .try_send(AudioEvent::Error(String::from("Output stream error")));
            },
            None,
        )?;

        input_stream.play()?;
        output_stream.play()?;
        log::info!(
            "audio streams started at {}Hz ({}ch in, {}ch out)",
            SAMPLE_RATE,
            input_channels,
            output_channels
        );

        Ok((input_stream, output_stream))
    }

    pub fn input_device_name(&self) -> &str {
        &self.input_device_name
    }

    pub fn output_device_name(&self) -> &str {
        &self.output_device_name
    }

    pub fn list_devices(&self) -> Result<()> {
        println!("Available input devices:");
        for (i, device) in self.host.input_devices()?.enumerate() {
            println!(
                "  {}: {}",
                i,
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );
        }

        println!("\nAvailable output devices:");
        for (i, device) in self.host.output_devices()?.enumerate() {
            println!(
                "  {}: {}",
                i,
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );
        }

        Ok(())
    }
}
