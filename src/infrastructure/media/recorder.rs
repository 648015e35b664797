//! Voicemail / call recording capture
//!
//! Consumes caller-leg RTP (already header-stripped by the parser) and
//! appends the G.711 payload to a WAV file. Stops on cancellation, max
//! duration, or silence (no packet for 5 s). The WAV header is rewritten
//! with the final data size on close.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use super::g711::G711Codec;
use super::rtp::RtpPacket;
use super::wav::{WavWriter, SAMPLE_RATE};
use crate::{DomainError, Result};

pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    MaxDuration,
    SilenceTimeout,
}

/// Result of a capture
#[derive(Debug, Clone)]
pub struct Capture {
    pub file_path: PathBuf,
    pub duration_secs: u32,
    pub packet_count: u64,
    pub stop_reason: StopReason,
}

/// Record RTP payloads into `path` until a stop condition fires. The
/// silence window restarts on every received packet.
pub async fn record_to_wav(
    rx: &mut mpsc::Receiver<RtpPacket>,
    path: &Path,
    codec: G711Codec,
    max_duration: Duration,
    silence_timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Result<Capture> {
    let mut writer = WavWriter::create(path, codec)
        .map_err(|e| DomainError::Internal(format!("create wav: {}", e)))?;
    let deadline = Instant::now() + max_duration;
    let mut packet_count = 0u64;

    let stop_reason = loop {
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => {
                    // only the negotiated audio payload lands in the file
                    if packet.payload_type == codec.payload_type() {
                        writer
                            .write_payload(&packet.payload)
                            .map_err(|e| DomainError::Internal(format!("write wav: {}", e)))?;
                        packet_count += 1;
                    }
                }
                // media path gone: treat like a hangup
                None => break StopReason::Cancelled,
            },
            _ = tokio::time::sleep(silence_timeout) => {
                debug!("recording stopped: silence timeout");
                break StopReason::SilenceTimeout;
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!("recording stopped: max duration reached");
                break StopReason::MaxDuration;
            }
            _ = cancel.wait_for(|c| *c) => {
                debug!("recording stopped: call cancelled");
                break StopReason::Cancelled;
            }
        }
    };

    let duration_secs = writer.data_len() / SAMPLE_RATE;
    let file_path = writer
        .finalize()
        .map_err(|e| DomainError::Internal(format!("finalize wav: {}", e)))?;
    info!(
        path = %file_path.display(),
        duration_secs,
        packet_count,
        ?stop_reason,
        "capture complete"
    );
    Ok(Capture {
        file_path,
        duration_secs,
        packet_count,
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn audio_packet(seq: u16, payload_type: u8) -> RtpPacket {
        RtpPacket::new(
            payload_type,
            seq,
            seq as u32 * 160,
            7,
            Bytes::from(vec![0xFFu8; 160]),
        )
    }

    #[tokio::test]
    async fn test_capture_writes_payload_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.wav");
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        // 50 frames of 160 bytes = 1 second of audio
        for seq in 0..50u16 {
            tx.send(audio_packet(seq, 0)).await.unwrap();
        }
        drop(tx); // sender gone ends the capture

        let capture = record_to_wav(&mut rx, &path, G711Codec::Ulaw, Duration::from_secs(60), SILENCE_TIMEOUT, cancel_rx)
            .await
            .unwrap();

        assert_eq!(capture.packet_count, 50);
        assert_eq!(capture.duration_secs, 1);
        assert_eq!(capture.stop_reason, StopReason::Cancelled);

        let wav = super::super::wav::WavFile::open(&path).unwrap();
        assert_eq!(wav.data.len(), 50 * 160);
    }

    #[tokio::test]
    async fn test_foreign_payload_types_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.wav");
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        tx.send(audio_packet(1, 0)).await.unwrap();
        tx.send(audio_packet(2, 101)).await.unwrap(); // telephone-event
        tx.send(audio_packet(3, 0)).await.unwrap();
        drop(tx);

        let capture = record_to_wav(&mut rx, &path, G711Codec::Ulaw, Duration::from_secs(60), SILENCE_TIMEOUT, cancel_rx)
            .await
            .unwrap();
        assert_eq!(capture.packet_count, 2);

        let wav = super::super::wav::WavFile::open(&path).unwrap();
        assert_eq!(wav.data.len(), 2 * 160);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.wav");
        let (_tx, mut rx) = mpsc::channel::<RtpPacket>(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        // with no packets the 2s max duration races the 5s silence timeout
        let capture = record_to_wav(&mut rx, &path, G711Codec::Ulaw, Duration::from_secs(2), SILENCE_TIMEOUT, cancel_rx)
            .await
            .unwrap();
        assert_eq!(capture.stop_reason, StopReason::MaxDuration);
        assert_eq!(capture.duration_secs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_timeout_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.wav");
        let (_tx, mut rx) = mpsc::channel::<RtpPacket>(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let capture = record_to_wav(&mut rx, &path, G711Codec::Ulaw, Duration::from_secs(60), SILENCE_TIMEOUT, cancel_rx)
            .await
            .unwrap();
        assert_eq!(capture.stop_reason, StopReason::SilenceTimeout);
    }

    #[tokio::test]
    async fn test_cancel_stops_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.wav");
        let (_tx, mut rx) = mpsc::channel::<RtpPacket>(4);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let path = path.clone();
            async move {
                record_to_wav(&mut rx, &path, G711Codec::Ulaw, Duration::from_secs(60), SILENCE_TIMEOUT, cancel_rx)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let capture = handle.await.unwrap().unwrap();
        assert_eq!(capture.stop_reason, StopReason::Cancelled);
    }
}
