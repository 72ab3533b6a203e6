use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::transform::{
    Artifact, ArtifactDescriptor, AudioFormat, FormatOptions, TransformRequest, Transformer,
};

const CODE: &str = "engineAudio";

/// Decodes WAV sources and re-encodes them as 16-bit PCM data URIs.
pub struct WavTransformer;

#[async_trait]
impl Transformer for WavTransformer {
    async fn transform(&self, request: &TransformRequest) -> anyhow::Result<ArtifactDescriptor> {
        tracing::debug!(source = %request.source, "reading");
        let bytes = tokio::fs::read(&request.source).await?;
        let file = request.coord.file.clone();
        let options = request.options.clone();

        // Decoding is CPU bound.
        tokio::task::spawn_blocking(move || encode(&file, &bytes, &options)).await?
    }
}

/// Produces the single audio artifact of one WAV file named `file`.
pub fn encode(file: &str, bytes: &[u8], options: &FormatOptions) -> anyhow::Result<ArtifactDescriptor> {
    let (spec, samples) = decode(bytes)?;

    let mut data = BTreeMap::new();
    for format in &options.audio_formats {
        let payload = match format {
            AudioFormat::Wav => write_pcm16(spec, &samples)?,
        };

        let uri = format!("data:{};base64,{}", format.mime(), STANDARD.encode(payload));
        data.insert(format.as_str().to_owned(), uri);
    }

    let mut descriptor = ArtifactDescriptor::new();
    descriptor.insert(
        file,
        Artifact::Audio {
            code: CODE.into(),
            data,
        },
    )?;

    Ok(descriptor)
}

fn decode(bytes: &[u8]) -> anyhow::Result<(WavSpec, Vec<i16>)> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| rescale(s, bits)))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok((spec, samples))
}

fn rescale(sample: i32, bits: u16) -> i16 {
    let scaled = match bits {
        16 => sample,
        b if b > 16 => sample >> (b - 16),
        b => sample << (16 - b),
    };
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn write_pcm16(source: WavSpec, samples: &[i16]) -> anyhow::Result<Vec<u8>> {
    let spec = WavSpec {
        channels: source.channels,
        sample_rate: source.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(buffer.into_inner())
}
