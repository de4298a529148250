//! Bounce an offline render to a WAV file.

use crate::engine::AudioCallback;
use crate::error::RenderError;
use crate::rt::{render_offline, OfflineRender};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;

/// Sample encoding of a bounced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavEncoding {
    /// 32-bit IEEE float, written as rendered.
    #[default]
    Float32,
    /// 16-bit PCM, clipped to [-1, 1].
    Pcm16,
}

impl WavEncoding {
    fn spec(self, channels: u16, sample_rate: u32) -> WavSpec {
        let (bits_per_sample, sample_format) = match self {
            WavEncoding::Float32 => (32, SampleFormat::Float),
            WavEncoding::Pcm16 => (16, SampleFormat::Int),
        };
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }
}

/// Write `render` to `path`.
pub fn write_wav(
    path: impl AsRef<Path>,
    render: &OfflineRender,
    sample_rate: u32,
    encoding: WavEncoding,
) -> Result<(), RenderError> {
    if render.channels.is_empty() {
        return Err(RenderError::NoOutputChannels);
    }
    let channels = u16::try_from(render.channels.len()).map_err(|_| RenderError::TooManyChannels)?;
    let mut writer = WavWriter::create(path.as_ref(), encoding.spec(channels, sample_rate))?;
    for sample in render.interleaved() {
        match encoding {
            WavEncoding::Float32 => writer.write_sample(sample)?,
            WavEncoding::Pcm16 => {
                let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                writer.write_sample(scaled)?;
            }
        }
    }
    writer.finalize()?;
    tracing::info!(
        path = %path.as_ref().display(),
        frames = render.frames(),
        channels,
        "render written"
    );
    Ok(())
}

/// Render `frames` frames offline and write them to `path` as 32-bit float.
pub fn render_to_wav(
    path: impl AsRef<Path>,
    callback: &mut AudioCallback,
    frames: usize,
) -> Result<OfflineRender, RenderError> {
    if callback.config().output_channels == 0 {
        return Err(RenderError::NoOutputChannels);
    }
    let sample_rate = callback.config().sample_rate.round() as u32;
    let render = render_offline(callback, frames);
    if render.dropped_blocks() > 0 {
        tracing::warn!(dropped = render.dropped_blocks(), "offline render dropped blocks");
    }
    write_wav(path, &render, sample_rate, WavEncoding::Float32)?;
    Ok(render)
}
