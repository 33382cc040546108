//! Audio upload validation.
//!
//! Uploads are checked before anything is sent upstream: filename, extension
//! allow-list, size cap, then a best-effort content sniff. A sniff that
//! cannot run degrades to trusting the extension; a sniff that runs and finds
//! non-audio content rejects the upload.

use std::io::{Cursor, ErrorKind};
use std::panic::{self, AssertUnwindSafe};

use symphonia::core::codecs::{
    CodecType, CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
    CODEC_TYPE_OPUS, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_U8, CODEC_TYPE_VORBIS,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::get_probe;
use tracing::{info, warn};

/// File extensions accepted by upload validation, with the leading dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".flac", ".opus", ".ogg"];

/// Largest accepted upload, in bytes (50 MiB).
pub const MAX_AUDIO_FILE_SIZE: usize = 50 * 1024 * 1024;

/// MIME reported when the probe finds no audio container in the content.
const NON_AUDIO_MIME: &str = "application/octet-stream";

/// The sniffing tool itself failed; says nothing about the content.
#[derive(Debug, thiserror::Error)]
#[error("content sniffing failed: {0}")]
pub struct SniffError(String);

/// Upload metadata that passed every check.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ValidatedUpload {
    pub filename: String,
    /// Lowercased extension including the leading dot.
    pub extension: String,
}

/// Validates an audio upload.
///
/// `sniff` is only invoked once the cheap checks pass and must return the
/// detected MIME type. Returns a human-readable reason on rejection.
pub fn validate_upload<F>(
    filename: Option<&str>,
    size_bytes: usize,
    sniff: F,
) -> Result<ValidatedUpload, String>
where
    F: FnOnce() -> Result<String, SniffError>,
{
    let filename = filename
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| "Filename is required".to_string())?;

    let extension = extension_of(filename)
        .filter(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| {
            format!(
                "Unsupported file format. Allowed formats: {}",
                SUPPORTED_EXTENSIONS.join(", ")
            )
        })?;

    if size_bytes > MAX_AUDIO_FILE_SIZE {
        return Err(format!(
            "File too large ({:.1}MB). Maximum size: {}MB",
            size_bytes as f64 / (1024.0 * 1024.0),
            MAX_AUDIO_FILE_SIZE / (1024 * 1024)
        ));
    }

    if size_bytes == 0 {
        return Err("uploaded file is empty".to_string());
    }

    match sniff() {
        Ok(mime) if mime.starts_with("audio/") => {
            info!(filename, mime = %mime, size_bytes, "audio file validated");
        }
        Ok(mime) => {
            return Err(format!(
                "Invalid file format. Expected audio file, got: {mime}"
            ));
        }
        Err(err) => {
            warn!(filename, error = %err, "MIME detection failed; relying on file extension");
        }
    }

    Ok(ValidatedUpload {
        filename: filename.to_string(),
        extension,
    })
}

/// Returns the lowercased extension of `filename`, including the dot.
fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(format!(".{}", ext.trim().to_ascii_lowercase()))
}

/// Detects the MIME type of `bytes` by probing for a known audio container.
///
/// A probe that stops early (truncated stream, unknown codec) falls back to
/// the container's leading magic bytes. Content with neither is reported as
/// `application/octet-stream`. Errors are reserved for probe failures that
/// say nothing about the content.
pub fn sniff_mime(bytes: &[u8]) -> Result<String, SniffError> {
    let probe = panic::catch_unwind(AssertUnwindSafe(|| probe_codec(bytes)))
        .map_err(|_| SniffError("format probe panicked".to_string()))?;

    if let Ok(codec) = probe {
        if codec != CODEC_TYPE_NULL {
            return Ok(mime_for_codec(codec).to_string());
        }
    }
    if let Some(mime) = container_mime(bytes) {
        return Ok(mime.to_string());
    }

    match probe {
        Ok(_) => Err(SniffError(
            "container has no track with a known codec".to_string(),
        )),
        Err(SymphoniaError::Unsupported(_)) => Ok(NON_AUDIO_MIME.to_string()),
        Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Ok(NON_AUDIO_MIME.to_string())
        }
        Err(err) => Err(SniffError(err.to_string())),
    }
}

/// MIME implied by the leading container marker, if any.
fn container_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [b'f', b'L', b'a', b'C', ..] => Some("audio/flac"),
        [b'O', b'g', b'g', b'S', ..] => Some("audio/ogg"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => Some("audio/wav"),
        _ => None,
    }
}

fn probe_codec(bytes: &[u8]) -> Result<CodecType, SymphoniaError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = get_probe().format(
        &Hint::new(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    Ok(probed
        .format
        .default_track()
        .map(|track| track.codec_params.codec)
        .unwrap_or(CODEC_TYPE_NULL))
}

fn mime_for_codec(codec: CodecType) -> &'static str {
    match codec {
        CODEC_TYPE_FLAC => "audio/flac",
        CODEC_TYPE_OPUS | CODEC_TYPE_VORBIS => "audio/ogg",
        CODEC_TYPE_MP3 => "audio/mpeg",
        CODEC_TYPE_AAC | CODEC_TYPE_ALAC => "audio/mp4",
        CODEC_TYPE_PCM_U8 | CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S32LE
        | CODEC_TYPE_PCM_F32LE => "audio/wav",
        _ => "audio/x-unknown",
    }
}

/// Minimal 16-bit mono PCM WAV file.
#[cfg(test)]
pub(crate) fn tiny_wav() -> Vec<u8> {
    let samples: Vec<u8> = (0..64u8).collect();
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8_000u32.to_le_bytes());
    out.extend_from_slice(&16_000u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    out.extend_from_slice(&samples);
    out
}

/// FLAC stream header: marker plus a single STREAMINFO block, no frames.
#[cfg(test)]
pub(crate) fn tiny_flac() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"fLaC");
    // last metadata block, type STREAMINFO, 34 bytes
    out.extend_from_slice(&[0x80, 0x00, 0x00, 34]);
    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    // 8 kHz, mono, 16 bits per sample, unknown length
    let packed = (8_000u64 << 44) | (15u64 << 36);
    out.extend_from_slice(&packed.to_be_bytes());
    out.extend_from_slice(&[0; 16]);
    out
}

/// Ogg/Opus header pages (`OpusHead` then `OpusTags`), no audio packets.
#[cfg(test)]
pub(crate) fn tiny_ogg_opus() -> Vec<u8> {
    let mut head = Vec::new();
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(1);
    head.extend_from_slice(&312u16.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);

    let vendor = b"fraudsense";
    let mut tags = Vec::new();
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());

    let mut out = ogg_page(0x02, 0, &head);
    out.extend(ogg_page(0x00, 1, &tags));
    out
}

#[cfg(test)]
fn ogg_page(header_type: u8, sequence: u32, packet: &[u8]) -> Vec<u8> {
    let mut page = Vec::new();
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(header_type);
    page.extend_from_slice(&0u64.to_le_bytes());
    page.extend_from_slice(&0x4653_u32.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&0u32.to_le_bytes());
    page.push(1);
    page.push(packet.len() as u8);
    page.extend_from_slice(packet);

    let crc = ogg_crc(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

#[cfg(test)]
fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}
