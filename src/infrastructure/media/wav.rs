//! WAV read/write for G.711 recordings
//!
//! Canonical 44-byte RIFF/WAVE layout: one 16-byte fmt chunk and one data
//! chunk, 8 kHz mono 8-bit, audio format 6 (A-law) or 7 (u-law).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::g711::G711Codec;

pub const SAMPLE_RATE: u32 = 8000;
const HEADER_LEN: u64 = 44;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid WAV: {0}")]
    Invalid(String),

    #[error("Unsupported format: {0}")]
    Unsupported(String),
}

/// Incremental writer. The header is written up front with zero sizes and
/// rewritten on `finalize` once the payload length is known.
pub struct WavWriter {
    file: File,
    path: PathBuf,
    codec: G711Codec,
    data_len: u32,
}

impl WavWriter {
    pub fn create<P: AsRef<Path>>(path: P, codec: G711Codec) -> Result<Self, WavError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        write_header(&mut file, codec, 0)?;
        Ok(Self {
            file,
            path,
            codec,
            data_len: 0,
        })
    }

    /// Append raw G.711 payload bytes.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), WavError> {
        self.file.write_all(payload)?;
        self.data_len += payload.len() as u32;
        Ok(())
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Whole seconds of audio captured so far (8000 bytes per second).
    pub fn duration_secs(&self) -> u32 {
        self.data_len / SAMPLE_RATE
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the header with final sizes and flush.
    pub fn finalize(mut self) -> Result<PathBuf, WavError> {
        self.file.seek(SeekFrom::Start(0))?;
        write_header(&mut self.file, self.codec, self.data_len)?;
        self.file.flush()?;
        Ok(self.path)
    }
}

fn write_header(file: &mut File, codec: G711Codec, data_len: u32) -> Result<(), WavError> {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&codec.wav_format_code().to_le_bytes());
    header[22..24].copy_from_slice(&1u16.to_le_bytes()); // mono
    header[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    header[28..32].copy_from_slice(&SAMPLE_RATE.to_le_bytes()); // byte rate = rate * 1ch * 1B
    header[32..34].copy_from_slice(&1u16.to_le_bytes()); // block align
    header[34..36].copy_from_slice(&8u16.to_le_bytes()); // bits per sample
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

/// A loaded G.711 WAV file
#[derive(Debug, Clone)]
pub struct WavFile {
    pub codec: G711Codec,
    /// Raw companded payload
    pub data: Vec<u8>,
}

impl WavFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WavError> {
        let mut file = File::open(path)?;
        Self::read(&mut file)
    }

    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, WavError> {
        let mut riff = [0u8; 12];
        reader.read_exact(&mut riff)?;
        if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
            return Err(WavError::Invalid("missing RIFF/WAVE signature".into()));
        }

        let mut codec: Option<G711Codec> = None;
        let mut data: Option<Vec<u8>> = None;

        loop {
            let mut chunk = [0u8; 8];
            if reader.read_exact(&mut chunk).is_err() {
                break;
            }
            let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as usize;
            match &chunk[0..4] {
                b"fmt " => {
                    if size < 16 {
                        return Err(WavError::Invalid("fmt chunk too small".into()));
                    }
                    let mut fmt = vec![0u8; size];
                    reader.read_exact(&mut fmt)?;
                    let format = u16::from_le_bytes([fmt[0], fmt[1]]);
                    let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                    let rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                    let bits = u16::from_le_bytes([fmt[14], fmt[15]]);

                    let g711 = G711Codec::from_wav_format_code(format).ok_or_else(|| {
                        WavError::Unsupported(format!("audio format {}", format))
                    })?;
                    if channels != 1 || rate != SAMPLE_RATE || bits != 8 {
                        return Err(WavError::Unsupported(format!(
                            "{} ch / {} Hz / {} bit",
                            channels, rate, bits
                        )));
                    }
                    codec = Some(g711);
                }
                b"data" => {
                    let mut payload = vec![0u8; size];
                    reader.read_exact(&mut payload)?;
                    data = Some(payload);
                }
                _ => {
                    reader.seek(SeekFrom::Current(size as i64))?;
                }
            }
            // chunks are word-aligned
            if size % 2 != 0 {
                reader.seek(SeekFrom::Current(1))?;
            }
            if codec.is_some() && data.is_some() {
                break;
            }
        }

        let codec = codec.ok_or_else(|| WavError::Invalid("missing fmt chunk".into()))?;
        let data = data.ok_or_else(|| WavError::Invalid("missing data chunk".into()))?;
        Ok(Self { codec, data })
    }

    pub fn duration_secs(&self) -> f64 {
        self.data.len() as f64 / SAMPLE_RATE as f64
    }

    /// Decode the payload to linear PCM.
    pub fn samples(&self) -> Vec<i16> {
        self.codec.decode(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let payload: Vec<u8> = (0..16000).map(|i| (i % 251) as u8).collect();
        let mut writer = WavWriter::create(&path, G711Codec::Ulaw).unwrap();
        writer.write_payload(&payload[..8000]).unwrap();
        writer.write_payload(&payload[8000..]).unwrap();
        assert_eq!(writer.duration_secs(), 2);
        writer.finalize().unwrap();

        let wav = WavFile::open(&path).unwrap();
        assert_eq!(wav.codec, G711Codec::Ulaw);
        assert_eq!(wav.data.len(), payload.len());
        assert_eq!(wav.data, payload);
        assert!((wav.duration_secs() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_header_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alaw.wav");

        let mut writer = WavWriter::create(&path, G711Codec::Alaw).unwrap();
        writer.write_payload(&[0x55; 800]).unwrap();
        writer.finalize().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 44 + 800);
        assert_eq!(&raw[0..4], b"RIFF");
        // RIFF size = 36 + data
        assert_eq!(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]), 836);
        // format code 6 = A-law
        assert_eq!(u16::from_le_bytes([raw[20], raw[21]]), 6);
        // 8 kHz mono 8-bit
        assert_eq!(u32::from_le_bytes([raw[24], raw[25], raw[26], raw[27]]), 8000);
        assert_eq!(u16::from_le_bytes([raw[22], raw[23]]), 1);
        assert_eq!(u16::from_le_bytes([raw[34], raw[35]]), 8);
        // data chunk length
        assert_eq!(u32::from_le_bytes([raw[40], raw[41], raw[42], raw[43]]), 800);
    }

    #[test]
    fn test_rejects_pcm_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm.wav");
        // hand-build a 16-bit PCM header
        let mut raw = Vec::new();
        raw.extend_from_slice(b"RIFF");
        raw.extend_from_slice(&36u32.to_le_bytes());
        raw.extend_from_slice(b"WAVE");
        raw.extend_from_slice(b"fmt ");
        raw.extend_from_slice(&16u32.to_le_bytes());
        raw.extend_from_slice(&1u16.to_le_bytes()); // PCM
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&8000u32.to_le_bytes());
        raw.extend_from_slice(&16000u32.to_le_bytes());
        raw.extend_from_slice(&2u16.to_le_bytes());
        raw.extend_from_slice(&16u16.to_le_bytes());
        raw.extend_from_slice(b"data");
        raw.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, &raw).unwrap();

        match WavFile::open(&path) {
            Err(WavError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_non_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.wav");
        std::fs::write(&path, b"definitely not a wav file").unwrap();
        assert!(WavFile::open(&path).is_err());
    }
}
