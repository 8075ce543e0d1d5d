//! Subcommand implementations. Each one plays the part of the transport
//! layer around the core: it feeds chunks in or carries frames out.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use crossbeam_channel::RecvTimeoutError;
use parley_core::{
    audio::{device, resample::RateConverter},
    codec, AudioFrame, CaptureEncoder, MicrophoneStream, ParleyError, PlaybackHandle,
    PlaybackService, PlaybackStatus,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::settings::{save_settings, CliSettings};

/// Samples per chunk when playing a WAV file (200 ms at 24 kHz).
const WAV_CHUNK_SAMPLES: usize = 4_800;

pub fn devices(json: bool) -> anyhow::Result<()> {
    let mut all = device::list_input_devices();
    all.extend(device::list_output_devices());

    if json {
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }
    if all.is_empty() {
        println!("no audio devices found");
        return Ok(());
    }
    for d in &all {
        let mut tags = Vec::new();
        if d.is_default {
            tags.push("default");
        }
        if d.is_recommended {
            tags.push("recommended");
        }
        if d.is_loopback_like {
            tags.push("loopback?");
        }
        println!("{:<7} {}  {}", format!("{:?}", d.direction).to_lowercase(), d.name, tags.join(","));
    }
    Ok(())
}

pub fn record(
    settings: &CliSettings,
    seconds: f64,
    output: Option<&Path>,
    wav: Option<&Path>,
) -> anyhow::Result<()> {
    let config = settings.capture_config();
    let stream = MicrophoneStream::acquire(config.preferred_input_device.as_deref())
        .context("could not open the microphone")?;

    let mut lines: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let mut wav_writer = match wav {
        Some(path) => Some(
            hound::WavWriter::create(
                path,
                hound::WavSpec {
                    channels: 1,
                    sample_rate: config.sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                },
            )
            .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => None,
    };

    let mut encoder = CaptureEncoder::new(config);
    let (tx, rx) = crossbeam_channel::unbounded::<AudioFrame>();
    encoder
        .start_capture(stream, move |frame| {
            let _ = tx.send(frame);
        })
        .context("could not start capture")?;

    let mut write_frame = |frame: AudioFrame| -> anyhow::Result<()> {
        writeln!(lines, "{}", frame.base64)?;
        if let Some(writer) = wav_writer.as_mut() {
            let bytes = STANDARD.decode(&frame.base64)?;
            for pair in bytes.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
        }
        Ok(())
    };

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    loop {
        match rx.recv_deadline(deadline) {
            Ok(frame) => write_frame(frame)?,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    encoder.stop_capture();
    for frame in rx.try_iter() {
        write_frame(frame)?;
    }
    drop(write_frame);

    lines.flush()?;
    if let Some(writer) = wav_writer {
        writer.finalize().context("finalizing WAV file")?;
    }
    let stats = encoder.diagnostics_snapshot();
    info!(
        frames = stats.frames_emitted,
        dropped = stats.samples_dropped,
        "recording finished"
    );
    Ok(())
}

pub fn play(settings: &CliSettings, input: &Path) -> anyhow::Result<()> {
    let config = settings.playback_config();
    let sample_rate = config.sample_rate;
    let service = PlaybackService::spawn_default(config).context("could not start playback")?;
    let handle = service.handle();
    let mut events = handle.subscribe_events();

    let is_wav = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    let (queued, rejected) = if is_wav {
        queue_wav(&handle, input, sample_rate)?
    } else {
        queue_lines(&handle, input)?
    };
    info!(queued, rejected, "input queued, waiting for playback to finish");

    loop {
        if handle.status()? != PlaybackStatus::Draining {
            break;
        }
        match events.blocking_recv() {
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    service.shutdown();
    Ok(())
}

/// One base64 chunk per line; blank lines are skipped.
fn queue_lines(handle: &PlaybackHandle, input: &Path) -> anyhow::Result<(usize, usize)> {
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let (mut queued, mut rejected) = (0, 0);
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match handle.queue_audio(line) {
            Ok(()) => queued += 1,
            Err(ParleyError::Decode(e)) => {
                warn!(line = line_no + 1, "skipping chunk: {e}");
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((queued, rejected))
}

/// Any WAV is downmixed and converted to `target` (the rate the service was
/// configured with), then queued in fixed-size chunks.
fn queue_wav(
    handle: &PlaybackHandle,
    input: &Path,
    target: u32,
) -> anyhow::Result<(usize, usize)> {
    let mut reader =
        hound::WavReader::open(input).with_context(|| format!("opening {}", input.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    let samples = if spec.sample_rate == target {
        mono
    } else {
        let mut converter = RateConverter::new(spec.sample_rate, target, WAV_CHUNK_SAMPLES)?;
        let mut out = converter.process(&mono);
        // Flush the converter's tail with silence.
        out.extend(converter.process(&vec![0.0; WAV_CHUNK_SAMPLES]));
        out
    };
    if samples.is_empty() {
        bail!("{} contains no audio", input.display());
    }

    let mut queued = 0;
    for block in samples.chunks(WAV_CHUNK_SAMPLES) {
        handle.queue_audio(codec::encode_base64(block))?;
        queued += 1;
    }
    Ok((queued, 0))
}

/// Microphone -> encoder -> decoder -> speaker, through the same base64
/// frames a network transport would carry.
pub fn loopback(settings: &CliSettings, seconds: f64) -> anyhow::Result<()> {
    let capture_config = settings.capture_config();
    let playback_config = settings.playback_config();

    let service =
        PlaybackService::spawn_default(playback_config.clone()).context("could not start playback")?;
    let handle = service.handle();
    handle.init().context("could not open the output device")?;

    let stream = MicrophoneStream::acquire(capture_config.preferred_input_device.as_deref())
        .context("could not open the microphone")?;
    let mut converter = RateConverter::new(
        capture_config.sample_rate,
        playback_config.sample_rate,
        capture_config.block_size,
    )?;

    let mut encoder = CaptureEncoder::new(capture_config);
    let (tx, rx) = crossbeam_channel::bounded::<AudioFrame>(32);
    encoder
        .start_capture(stream, move |frame| {
            if tx.try_send(frame).is_err() {
                warn!("loopback consumer is behind, dropping a frame");
            }
        })
        .context("could not start capture")?;
    warn!("loopback is audible: use headphones to avoid feedback");

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let mut forward = |frame: AudioFrame| -> anyhow::Result<()> {
        let capture_rate = codec::decode_base64(&frame.base64)?;
        let playback_rate = converter.process(&capture_rate);
        if !playback_rate.is_empty() {
            handle.queue_audio(codec::encode_base64(&playback_rate))?;
        }
        Ok(())
    };
    loop {
        match rx.recv_deadline(deadline) {
            Ok(frame) => forward(frame)?,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    encoder.stop_capture();
    for frame in rx.try_iter() {
        forward(frame)?;
    }

    let stats = handle.diagnostics_snapshot();
    info!(
        chunks = stats.chunks_queued,
        max_active = stats.max_active_nodes,
        "loopback finished"
    );
    handle.stop()?;
    service.shutdown();
    Ok(())
}

pub fn save(
    path: &Path,
    mut settings: CliSettings,
    input_device: Option<String>,
    volume: Option<f32>,
    block_size: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(device) = input_device {
        settings.preferred_input_device = Some(device);
    }
    if let Some(volume) = volume {
        settings.volume = volume;
    }
    if let Some(block_size) = block_size {
        settings.capture_block_size = block_size;
    }
    settings.normalize();
    save_settings(path, &settings).with_context(|| format!("writing {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{PlaybackConfig, RecordingSink, SinkEvent};

    fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn wav_at_the_configured_rate_is_not_resampled() {
        let dir = std::env::temp_dir().join(format!("parley-wav-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tone.wav");
        let samples: Vec<i16> = (0..8_000).map(|i| ((i % 200) * 100) as i16).collect();
        write_wav(&path, 16_000, &samples);

        let sink = RecordingSink::new();
        let (sink_tx_out, sink_tx_in) = crossbeam_channel::bounded(1);
        let config = PlaybackConfig {
            sample_rate: 16_000,
            ..PlaybackConfig::default()
        };
        let service = PlaybackService::spawn(config, {
            let sink = sink.clone();
            move |events| {
                let _ = sink_tx_out.send(events);
                sink
            }
        })
        .unwrap();
        let handle = service.handle();

        let (queued, rejected) = queue_wav(&handle, &path, 16_000).unwrap();
        assert_eq!((queued, rejected), (2, 0));
        assert_eq!(sink.state().lock().opened_at_rate, Some(16_000));

        let completions = sink_tx_in.recv().unwrap();
        sink.mark_ended(1);
        completions.send(SinkEvent::NodeEnded(1)).unwrap();
        assert_eq!(handle.status().unwrap(), PlaybackStatus::Draining);
        service.shutdown();

        let rendered = sink.state().lock().rendered();
        assert_eq!(rendered.len(), samples.len());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
