//! Mux worker: the single owner of the encoder session and the muxer
//!
//! Runs on a dedicated thread with a current-thread tokio runtime, pulling raw
//! units from the per-track queues until told to drain or abort.

use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::stats::Statistics;
use crate::encoder::EncoderSession;
use crate::error::{FinalizeError, SessionError};
use crate::media::{EncodedAccessUnit, RawAudioBuffer, RawVideoFrame, Timestamp, Track};
use crate::mux::{FileOutput, Mp4Muxer, MuxSummary};

/// How the worker should end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Process everything queued, flush and finalize
    Drain,
    /// Drop queued units and delete the output file
    Abort,
}

/// What the worker did with the container
#[derive(Debug)]
pub enum WorkerOutcome {
    /// File finalized. `flush_error` is set when the encoder could not flush
    /// its tail; the container is still valid without those units.
    Finalized {
        summary: MuxSummary,
        flush_error: Option<FinalizeError>,
    },
    /// The container could not be finalized
    Failed(FinalizeError),
    /// Output deleted on abort
    Discarded,
}

pub struct WorkerQueues {
    pub video: mpsc::Receiver<RawVideoFrame>,
    pub audio: Option<mpsc::Receiver<RawAudioBuffer>>,
    pub signal: oneshot::Receiver<WorkerSignal>,
}

pub struct MuxWorker {
    encoder: EncoderSession,
    muxer: Mp4Muxer<FileOutput>,
    stats: Arc<Statistics>,
    frame_rate: u32,
    sample_rate: u32,
}

impl MuxWorker {
    pub fn new(
        encoder: EncoderSession,
        muxer: Mp4Muxer<FileOutput>,
        stats: Arc<Statistics>,
        frame_rate: u32,
        sample_rate: u32,
    ) -> Self {
        Self {
            encoder,
            muxer,
            stats,
            frame_rate,
            sample_rate,
        }
    }

    /// Start the worker thread
    pub fn spawn(self, queues: WorkerQueues) -> Result<JoinHandle<WorkerOutcome>, SessionError> {
        std::thread::Builder::new()
            .name("castrec-mux".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to build mux worker runtime: {}", e);
                        return WorkerOutcome::Failed(FinalizeError::Io(e));
                    }
                };
                runtime.block_on(self.run(queues))
            })
            .map_err(SessionError::WorkerSpawn)
    }

    async fn run(mut self, queues: WorkerQueues) -> WorkerOutcome {
        let WorkerQueues {
            video: mut video_rx,
            audio: mut audio_rx,
            signal: mut signal_rx,
        } = queues;
        debug!("Mux worker started");

        let signal = loop {
            tokio::select! {
                Some(frame) = video_rx.recv() => self.process_video(&frame),
                Some(buffer) = recv_audio(&mut audio_rx) => self.process_audio(&buffer),
                signal = &mut signal_rx => {
                    // a dropped sender means the engine went away; keep the file
                    break signal.unwrap_or(WorkerSignal::Drain);
                }
            }
        };

        match signal {
            WorkerSignal::Abort => self.abort(),
            WorkerSignal::Drain => {
                video_rx.close();
                let mut drained = 0usize;
                while let Ok(frame) = video_rx.try_recv() {
                    self.process_video(&frame);
                    drained += 1;
                }
                if let Some(audio_rx) = audio_rx.as_mut() {
                    audio_rx.close();
                    while let Ok(buffer) = audio_rx.try_recv() {
                        self.process_audio(&buffer);
                        drained += 1;
                    }
                }
                debug!(units = drained, "Drained queued units");
                self.finish()
            }
        }
    }

    fn process_video(&mut self, frame: &RawVideoFrame) {
        match self.encoder.encode_video(frame) {
            Ok(units) => {
                for unit in units {
                    self.write(unit);
                }
            }
            Err(e) => {
                debug!(error = %e, "Video frame dropped");
                self.stats.record_frame_dropped();
            }
        }
    }

    fn process_audio(&mut self, buffer: &RawAudioBuffer) {
        match self.encoder.encode_audio(buffer) {
            Ok(encoded) => {
                for unit in encoded.units {
                    self.write(unit);
                }
                if let Some(e) = encoded.error {
                    debug!(error = %e, "Audio frame dropped");
                    self.stats.record_audio_dropped();
                }
            }
            Err(e) => {
                debug!(error = %e, "Audio buffer dropped");
                self.stats.record_audio_dropped();
            }
        }
    }

    fn timestamp(&self, unit: &EncodedAccessUnit) -> Timestamp {
        unit.timestamp(self.frame_rate, self.sample_rate)
    }

    fn write(&mut self, unit: EncodedAccessUnit) {
        let timestamp = self.timestamp(&unit);
        let result = match unit.track {
            Track::Video => self
                .muxer
                .write_video_unit(&unit.data, timestamp, unit.keyframe),
            Track::Audio => self.muxer.write_audio_unit(&unit.data, timestamp),
        };
        match (unit.track, result) {
            (Track::Video, Ok(())) => self.stats.record_frame_written(),
            (Track::Audio, Ok(())) => self.stats.record_audio_written(),
            (Track::Video, Err(e)) => {
                warn!(error = %e, %timestamp, "Failed to write video unit");
                self.stats.record_frame_dropped();
            }
            (Track::Audio, Err(e)) => {
                warn!(error = %e, %timestamp, "Failed to write audio unit");
                self.stats.record_audio_dropped();
            }
        }
        self.stats.set_file_size(self.muxer.bytes_written());
    }

    /// Flush the encoder, write its tail in timestamp order and finalize
    fn finish(mut self) -> WorkerOutcome {
        let flush_error = match self.encoder.finalize() {
            Ok(flushed) => {
                let mut tail = flushed.units;
                tail.sort_by_key(|unit| self.timestamp(unit));
                for unit in tail {
                    self.write(unit);
                }
                if let Some(e) = &flushed.error {
                    error!("Encoder flush failed: {}", e);
                }
                flushed.error
            }
            Err(e) => {
                error!("Encoder flush failed: {}", e);
                Some(e)
            }
        };

        match self.muxer.finalize() {
            Ok(summary) => {
                self.stats.set_file_size(summary.bytes_written);
                info!(
                    video_samples = summary.video_samples,
                    audio_samples = summary.audio_samples,
                    video_duration = %summary.video_duration,
                    audio_duration = %summary.audio_duration,
                    bytes = summary.bytes_written,
                    "Container finalized"
                );
                WorkerOutcome::Finalized {
                    summary,
                    flush_error,
                }
            }
            Err(e) => {
                error!("Failed to finalize container: {}", e);
                WorkerOutcome::Failed(e)
            }
        }
    }

    fn abort(self) -> WorkerOutcome {
        if let Err(e) = self.muxer.discard() {
            warn!("Failed to delete aborted output: {}", e);
        }
        WorkerOutcome::Discarded
    }
}

async fn recv_audio(rx: &mut Option<mpsc::Receiver<RawAudioBuffer>>) -> Option<RawAudioBuffer> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
