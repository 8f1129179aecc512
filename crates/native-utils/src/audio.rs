use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;

/// Sample rate of the PCM16 audio the live service accepts from the microphone.
pub const LIVE_INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the PCM16 audio the live service streams back.
pub const LIVE_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Failure to turn an inbound base64 payload into PCM samples.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM16 payload has an odd byte length ({0})")]
    OddLength(usize),
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Continuous rate conversion for a pull-based output.
///
/// Source audio is pulled in whole resampler blocks only when the output
/// needs more, so the filter state runs across calls and never sees padding.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    block: Vec<f32>,
    resampled: Vec<Vec<f32>>,
    pending: VecDeque<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, block_size: usize) -> anyhow::Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, block_size)?)
        };
        let resampled = resampler
            .as_ref()
            .map(|r| r.output_buffer_allocate(true))
            .unwrap_or_default();
        Ok(Self {
            resampler,
            block: vec![0.0; block_size],
            resampled,
            pending: VecDeque::new(),
        })
    }

    /// Fills `out` at the output rate. `source` writes the next source
    /// samples into the slice it is given.
    pub fn fill(&mut self, out: &mut [f32], mut source: impl FnMut(&mut [f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            source(out);
            return;
        };
        while self.pending.len() < out.len() {
            self.block.resize(resampler.input_frames_next(), 0.0);
            source(&mut self.block);
            match resampler.process_into_buffer(&[self.block.as_slice()], &mut self.resampled, None) {
                Ok((_, produced)) => {
                    if let Some(channel) = self.resampled.first() {
                        self.pending.extend(&channel[..produced]);
                    }
                }
                Err(e) => {
                    tracing::warn!("output resampler rejected block: {}", e);
                    break;
                }
            }
        }
        let ready = self.pending.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(self.pending.drain(..ready)) {
            *slot = sample;
        }
        out[ready..].fill(0.0);
    }
}

/// Averages interleaved frames down to a single mono channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

/// Decodes a base64 string representing little-endian PCM16 audio into f32
/// samples normalised to -1.0..=1.0.
pub fn decode_pcm16(base64_fragment: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect())
}

/// Encodes f32 samples as base64 little-endian PCM16.
pub fn encode_pcm16(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = pcm32.to_binary();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

/// A trait for converting audio sample types to a binary representation (Vec<u8>).
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [i16] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter().flat_map(|&sample| sample.to_le_bytes()).collect()
    }
}

impl ToBinary for [f32] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|&sample| {
                let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                v.to_le_bytes()
            })
            .collect()
    }
}
