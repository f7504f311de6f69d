use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use stim_core::device::{AnalogWaveform, WaveformBank};

/// Decodes a raw little-endian `i16` sample file.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        bail!("odd byte count {}", bytes.len());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Waveform name: the file name up to its first `.`.
pub fn waveform_name(file: &str) -> &str {
    let base = Path::new(file)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file);
    base.split('.').next().unwrap_or(base)
}

/// Loads every listed file relative to `dir`.
///
/// Any failure leaves the caller with an empty bank; partially loaded banks
/// are never returned.
pub fn load_bank(dir: &Path, files: &[String]) -> Result<WaveformBank> {
    let mut bank = WaveformBank::new();
    for file in files {
        let path = dir.join(file);
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read waveform {}", path.display()))?;
        let samples = decode_samples(&bytes)
            .with_context(|| format!("bad waveform {}", path.display()))?;
        log::info!(
            "waveforms: loaded {} ({} samples)",
            waveform_name(file),
            samples.len()
        );
        bank.push(AnalogWaveform::new(waveform_name(file), samples));
    }
    Ok(bank)
}
