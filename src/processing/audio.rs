//! Input normalization for engines that need a fixed audio shape.
//!
//! Decodes any format symphonia understands, folds the channel layout to
//! stereo, resamples to the target rate and writes a 32-bit float WAV.
//! Everything here is synchronous; callers run it on a blocking thread and
//! stop it through a [`CancelFlag`], since a runtime waits for its blocking
//! threads before it exits.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hound::{SampleFormat, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::engine::InputSpec;
use crate::error::ProcessingError;

const RESAMPLE_CHUNK: usize = 1024;

/// Decoded stereo audio.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoAudio {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_rate: u32,
}

impl StereoAudio {
    pub fn frames(&self) -> usize {
        self.left.len()
    }
}

/// Shared stop request for a blocking normalization.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), ProcessingError> {
        if self.is_cancelled() {
            Err(ProcessingError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Returns a guard that cancels the flag when dropped, e.g. when the
    /// task awaiting the blocking work is aborted or torn down.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop(Some(self.clone()))
    }
}

/// Cancels its [`CancelFlag`] on drop unless disarmed.
#[derive(Debug)]
pub struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = &self.0 {
            flag.cancel();
        }
    }
}

fn audio_err(context: &str, e: impl std::fmt::Display) -> ProcessingError {
    ProcessingError::Audio(format!("{}: {}", context, e))
}

/// Decodes `path` into stereo samples.
///
/// Mono input is duplicated to both channels; input with more than two
/// channels keeps the first two.
pub fn decode(path: &Path, cancel: &CancelFlag) -> Result<StereoAudio, ProcessingError> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| audio_err("unsupported audio format", e))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| ProcessingError::Audio("no audio track found".into()))?
        .clone();
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| ProcessingError::Audio("could not determine sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| audio_err("failed to create decoder", e))?;

    let mut left = Vec::new();
    let mut right = Vec::new();

    loop {
        cancel.check()?;
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(audio_err("error reading packet", e)),
        };

        if packet.track_id() != track.id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(audio_err("error decoding audio", e)),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            continue;
        }

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        for frame in sample_buf.samples().chunks_exact(channels) {
            left.push(frame[0]);
            right.push(if channels == 1 { frame[0] } else { frame[1] });
        }
    }

    if left.is_empty() {
        return Err(ProcessingError::Audio(format!(
            "no audio samples decoded from {}",
            path.display()
        )));
    }

    Ok(StereoAudio {
        left,
        right,
        sample_rate,
    })
}

/// Resamples one channel from `from_rate` to `to_rate`.
pub fn resample_channel(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
    cancel: &CancelFlag,
) -> Result<Vec<f32>, ProcessingError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| audio_err("failed to create resampler", e))?;

    let mut output =
        Vec::with_capacity((samples.len() as f64 * ratio).ceil() as usize + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        cancel.check()?;
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| audio_err("resample error", e))?;
        output.extend_from_slice(&result[0]);
    }

    let remainder = chunks.remainder();
    let result = if remainder.is_empty() {
        resampler.process_partial(None::<&[&[f32]]>, None)
    } else {
        resampler.process_partial(Some(&[remainder]), None)
    }
    .map_err(|e| audio_err("resample error", e))?;
    output.extend_from_slice(&result[0]);

    Ok(output)
}

/// Writes stereo samples as a 32-bit float WAV.
pub fn write_wav(path: &Path, audio: &StereoAudio) -> Result<(), ProcessingError> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer =
        WavWriter::create(path, spec).map_err(|e| audio_err("failed to create WAV file", e))?;
    for (l, r) in audio.left.iter().zip(audio.right.iter()) {
        writer
            .write_sample(*l)
            .map_err(|e| audio_err("failed to write sample", e))?;
        writer
            .write_sample(*r)
            .map_err(|e| audio_err("failed to write sample", e))?;
    }
    writer
        .finalize()
        .map_err(|e| audio_err("failed to finalize WAV file", e))?;
    Ok(())
}

/// Decodes `input` and writes it to `output` in the shape `spec` asks for.
pub fn normalize(
    input: &Path,
    output: &Path,
    spec: InputSpec,
    cancel: &CancelFlag,
) -> Result<StereoAudio, ProcessingError> {
    let decoded = decode(input, cancel)?;

    let audio = if decoded.sample_rate == spec.sample_rate {
        decoded
    } else {
        StereoAudio {
            left: resample_channel(&decoded.left, decoded.sample_rate, spec.sample_rate, cancel)?,
            right: resample_channel(&decoded.right, decoded.sample_rate, spec.sample_rate, cancel)?,
            sample_rate: spec.sample_rate,
        }
    };

    cancel.check()?;
    write_wav(output, &audio)?;
    Ok(audio)
}
