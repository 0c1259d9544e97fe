//! WAV file read/write (§4.5, §6 "WAV format": RIFF/WAVE, PCM or
//! mu-law, 8 kHz, mono, 16-bit PCM or 8-bit mu-law).
//!
//! PCM goes through `hound`. `hound` only understands the PCM and
//! IEEE-float format tags, so the 8-bit companded (mu-law/A-law) case
//! used for recorded voicemail is framed and parsed by hand below.

use std::io::Cursor;

use crate::error::{MediaError, MediaResult};

pub const SAMPLE_RATE_HZ: u32 = 8_000;

const FORMAT_TAG_PCM: u16 = 1;
const FORMAT_TAG_ALAW: u16 = 6;
const FORMAT_TAG_MULAW: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Pcm16,
    MuLaw,
    ALaw,
}

/// A decoded WAV file: its format, sample rate, and raw sample bytes
/// (16-bit LE for PCM, one byte per sample for mu-law/A-law).
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub payload: Vec<u8>,
}

fn riff_chunks(bytes: &[u8]) -> MediaResult<Vec<(&[u8], &[u8])>> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(MediaError::UnsupportedFormat("missing RIFF/WAVE header".into()));
    }
    let mut chunks = Vec::new();
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let start = pos + 8;
        let end = (start + size).min(bytes.len());
        chunks.push((id, &bytes[start..end]));
        pos = end + (size % 2);
    }
    Ok(chunks)
}

fn find_chunk<'a>(chunks: &[(&'a [u8], &'a [u8])], id: &[u8; 4]) -> MediaResult<&'a [u8]> {
    chunks
        .iter()
        .find(|(chunk_id, _)| *chunk_id == id)
        .map(|(_, data)| *data)
        .ok_or_else(|| MediaError::UnsupportedFormat(format!("missing {:?} chunk", String::from_utf8_lossy(id))))
}

/// Read and decode a WAV file's contents per §4.5/§6.
pub fn read_wav(bytes: &[u8]) -> MediaResult<WavAudio> {
    let chunks = riff_chunks(bytes)?;
    let fmt = find_chunk(&chunks, b"fmt ")?;
    if fmt.len() < 16 {
        return Err(MediaError::UnsupportedFormat("fmt chunk too short".into()));
    }
    let format_tag = u16::from_le_bytes([fmt[0], fmt[1]]);

    match format_tag {
        FORMAT_TAG_PCM => {
            let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
            let spec = reader.spec();
            if spec.channels != 1 || spec.bits_per_sample != 16 {
                return Err(MediaError::UnsupportedFormat(format!(
                    "expected mono 16-bit PCM, got {} channel(s) at {} bits",
                    spec.channels, spec.bits_per_sample
                )));
            }
            let mut payload = Vec::with_capacity(reader.len() as usize * 2);
            for sample in reader.samples::<i16>() {
                payload.extend_from_slice(&sample?.to_le_bytes());
            }
            Ok(WavAudio { format: SampleFormat::Pcm16, sample_rate: spec.sample_rate, payload })
        }
        FORMAT_TAG_MULAW => read_companded(&chunks, fmt, SampleFormat::MuLaw),
        FORMAT_TAG_ALAW => read_companded(&chunks, fmt, SampleFormat::ALaw),
        other => Err(MediaError::UnsupportedFormat(format!("RIFF format tag {other}"))),
    }
}

fn read_companded(chunks: &[(&[u8], &[u8])], fmt: &[u8], format: SampleFormat) -> MediaResult<WavAudio> {
    let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
    let sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
    let bits_per_sample = u16::from_le_bytes([fmt[14], fmt[15]]);
    if channels != 1 || bits_per_sample != 8 {
        return Err(MediaError::UnsupportedFormat(format!(
            "expected mono 8-bit companded audio, got {channels} channel(s) at {bits_per_sample} bits"
        )));
    }
    let data = find_chunk(chunks, b"data")?;
    Ok(WavAudio { format, sample_rate, payload: data.to_vec() })
}

/// Encode `payload` as a WAV file of the given format (§4.5: "Writes
/// WAV files by prepending a correctly-sized RIFF/WAVE/fmt/data
/// header to raw payload").
pub fn write_wav(format: SampleFormat, sample_rate: u32, payload: &[u8]) -> MediaResult<Vec<u8>> {
    match format {
        SampleFormat::Pcm16 => write_pcm16(sample_rate, payload),
        SampleFormat::MuLaw => Ok(write_companded(FORMAT_TAG_MULAW, sample_rate, payload)),
        SampleFormat::ALaw => Ok(write_companded(FORMAT_TAG_ALAW, sample_rate, payload)),
    }
}

fn write_pcm16(sample_rate: u32, payload: &[u8]) -> MediaResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec)?;
        for chunk in payload.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(buf)
}

fn write_companded(format_tag: u16, sample_rate: u32, payload: &[u8]) -> Vec<u8> {
    let data_len = payload.len() as u32;
    let fmt_len: u32 = 16;
    let riff_len = 4 + (8 + fmt_len) + (8 + data_len);

    let mut out = Vec::with_capacity(12 + 8 + fmt_len as usize + 8 + payload.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&fmt_len.to_le_bytes());
    out.extend_from_slice(&format_tag.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes()); // byte rate: 1 byte/sample, mono
    out.extend_from_slice(&1u16.to_le_bytes()); // block align
    out.extend_from_slice(&8u16.to_le_bytes()); // bits per sample

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}
