//! Capture engine
//!
//! Owns the sources for the duration of a session and drives the lifecycle
//! `Idle -> Initializing -> Capturing <-> Paused -> Stopping -> Idle`. The
//! encoder session and the muxer are built here and handed to the mux worker,
//! which owns them until the session ends.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::stats::{DropRateMonitor, Statistics, StatsSnapshot};
use super::worker::{MuxWorker, WorkerOutcome, WorkerQueues, WorkerSignal};
use super::{EngineCommand, EngineState, EngineStatus};
use crate::capture::{create_capture_sources, AudioSource, Emitter, VideoSource};
use crate::config::{CaptureSettings, PipelineOptions};
use crate::encoder::{CodecProvider, EncoderSession};
use crate::error::SessionError;
use crate::media::{RawAudioBuffer, RawVideoFrame};
use crate::mux::{AudioTrackConfig, Mp4Muxer, MuxSummary, MuxerConfig, VideoTrackConfig};
use crate::threads::{join_bounded, join_bounded_async, JoinOutcome};

/// Builds the capture sources for each session
pub type SourceFactory =
    Box<dyn FnMut(&CaptureSettings) -> (VideoSource, Option<AudioSource>) + Send>;

/// Result of a clean stop
#[derive(Debug, Clone)]
pub struct StopReport {
    pub session_id: Uuid,
    pub path: PathBuf,
    pub summary: MuxSummary,
    pub stats: StatsSnapshot,
}

struct ActiveSession {
    id: Uuid,
    video: VideoSource,
    audio: Option<AudioSource>,
    signal_tx: oneshot::Sender<WorkerSignal>,
    worker: JoinHandle<WorkerOutcome>,
}

/// Drives capture sessions, one at a time
pub struct CaptureEngine {
    settings: CaptureSettings,
    options: PipelineOptions,
    provider: Arc<dyn CodecProvider>,
    sources: SourceFactory,
    state: EngineState,
    status_tx: broadcast::Sender<EngineStatus>,
    stats: Arc<Statistics>,
    paused: Arc<AtomicBool>,
    session: Option<ActiveSession>,
}

impl CaptureEngine {
    pub fn new(
        settings: CaptureSettings,
        options: PipelineOptions,
        provider: Arc<dyn CodecProvider>,
        status_tx: broadcast::Sender<EngineStatus>,
    ) -> Self {
        Self {
            settings,
            options,
            provider,
            sources: Box::new(create_capture_sources),
            state: EngineState::Idle,
            status_tx,
            stats: Arc::new(Statistics::new()),
            paused: Arc::new(AtomicBool::new(false)),
            session: None,
        }
    }

    /// Replace the built-in sources
    pub fn with_sources(mut self, sources: SourceFactory) -> Self {
        self.sources = sources;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Engine state change");
            self.state = state;
            let _ = self.status_tx.send(EngineStatus::State(state));
        }
    }

    /// Negotiate sources, open the encoder and the container, and start capture
    pub fn start_capture(&mut self) -> Result<(), SessionError> {
        if self.state != EngineState::Idle {
            return Err(SessionError::InvalidState {
                action: "start capture",
                state: self.state,
            });
        }
        self.set_state(EngineState::Initializing);

        match self.try_start() {
            Ok(session) => {
                info!(
                    session_id = %session.id,
                    path = ?self.settings.output_path,
                    "Capture started"
                );
                self.session = Some(session);
                self.set_state(EngineState::Capturing);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start capture: {}", e);
                let _ = self.status_tx.send(EngineStatus::Error(e.to_string()));
                self.set_state(EngineState::Idle);
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<ActiveSession, SessionError> {
        self.settings.validate()?;
        self.options.validate()?;
        let id = Uuid::new_v4();

        let (mut video, mut audio) = (self.sources)(&self.settings);

        // negotiate everything before building anything
        let geometry = video.negotiate()?;
        let audio_format = match audio.as_mut() {
            Some(source) => Some(source.negotiate()?),
            None => None,
        };
        info!(
            session_id = %id,
            video_source = video.name(),
            width = geometry.width,
            height = geometry.height,
            fps = geometry.frame_rate,
            audio = ?audio_format,
            "Sources negotiated"
        );

        let mut encoder = EncoderSession::new(self.provider.clone());
        encoder.initialize(&self.settings, geometry, audio_format)?;

        let muxer_config = MuxerConfig {
            video: VideoTrackConfig {
                codec: self.settings.codec,
                width: geometry.width,
                height: geometry.height,
                frame_rate: geometry.frame_rate,
                extradata: encoder.video_extradata(),
                keyframe_interval: self.options.keyframe_interval_for(geometry.frame_rate),
            },
            audio: match (audio_format, encoder.audio_frame_size()) {
                (Some(format), Some(frame_size)) => Some(AudioTrackConfig {
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                    samples_per_frame: frame_size as u32,
                    extradata: encoder.audio_extradata(),
                    bitrate: self.settings.audio_bitrate,
                }),
                _ => None,
            },
        };
        if let Some(parent) = self.settings.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                // a missing directory surfaces as an open error below
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let muxer = Mp4Muxer::create(&self.settings.output_path, muxer_config)?;

        self.stats.reset();
        self.paused.store(false, Ordering::SeqCst);

        let (video_tx, video_rx) = mpsc::channel(self.options.video_queue_capacity);
        let (audio_tx, audio_rx) = match audio_format {
            Some(_) => {
                let (tx, rx) = mpsc::channel(self.options.audio_queue_capacity);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let (signal_tx, signal_rx) = oneshot::channel();

        let worker = MuxWorker::new(
            encoder,
            muxer,
            self.stats.clone(),
            geometry.frame_rate,
            audio_format.map(|f| f.sample_rate).unwrap_or(1),
        )
        .spawn(WorkerQueues {
            video: video_rx,
            audio: audio_rx,
            signal: signal_rx,
        })?;

        let mut session = ActiveSession {
            id,
            video,
            audio,
            signal_tx,
            worker,
        };

        if let Err(e) = session.video.start(self.video_emitter(video_tx)) {
            self.abort(session);
            return Err(e.into());
        }
        if let Some(tx) = audio_tx {
            let started = match session.audio.as_mut() {
                Some(source) => source.start(self.audio_emitter(tx)),
                None => Ok(()),
            };
            if let Err(e) = started {
                warn!("Audio source failed to start, stopping video");
                self.abort(session);
                return Err(e.into());
            }
        }
        Ok(session)
    }

    /// Queue gate for video: discards while paused, counts queue-full drops
    fn video_emitter(&self, tx: mpsc::Sender<RawVideoFrame>) -> Emitter<RawVideoFrame> {
        let paused = self.paused.clone();
        let stats = self.stats.clone();
        Emitter::new(move |frame| {
            if paused.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = tx.try_send(frame) {
                stats.record_frame_dropped();
                if let TrySendError::Full(_) = e {
                    debug!("Video queue full, frame dropped");
                }
            }
        })
    }

    fn audio_emitter(&self, tx: mpsc::Sender<RawAudioBuffer>) -> Emitter<RawAudioBuffer> {
        let paused = self.paused.clone();
        let stats = self.stats.clone();
        Emitter::new(move |buffer| {
            if paused.load(Ordering::Relaxed) {
                return;
            }
            if let Err(e) = tx.try_send(buffer) {
                stats.record_audio_dropped();
                if let TrySendError::Full(_) = e {
                    debug!("Audio queue full, buffer dropped");
                }
            }
        })
    }

    /// Tear down a session that failed to start; the output file is deleted
    fn abort(&self, mut session: ActiveSession) {
        session.video.stop();
        if let Some(audio) = session.audio.as_mut() {
            audio.stop();
        }
        let _ = session.signal_tx.send(WorkerSignal::Abort);
        match join_bounded(session.worker, self.options.join_timeout) {
            JoinOutcome::Finished(_) => {}
            JoinOutcome::Panicked => warn!("Mux worker panicked during abort"),
            JoinOutcome::TimedOut(_) => warn!("Mux worker did not exit after abort"),
        }
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.state != EngineState::Capturing {
            return Err(SessionError::InvalidState {
                action: "pause",
                state: self.state,
            });
        }
        self.paused.store(true, Ordering::SeqCst);
        self.set_state(EngineState::Paused);
        info!("Capture paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state != EngineState::Paused {
            return Err(SessionError::InvalidState {
                action: "resume",
                state: self.state,
            });
        }
        self.paused.store(false, Ordering::SeqCst);
        self.set_state(EngineState::Capturing);
        info!("Capture resumed");
        Ok(())
    }

    /// Stop the sources, drain every queued unit and finalize the file.
    ///
    /// The engine is back in `Idle` afterwards, whatever the outcome. Blocks
    /// for up to the join timeout; async callers go through [`Self::supervise`].
    pub fn stop_capture(&mut self) -> Result<StopReport, SessionError> {
        let session = self.begin_stop()?;
        let (id, worker) = self.signal_drain(session);
        let joined = join_bounded(worker, self.options.join_timeout);
        self.complete_stop(id, joined)
    }

    async fn stop_capture_async(&mut self) -> Result<StopReport, SessionError> {
        let session = self.begin_stop()?;
        let (id, worker) = self.signal_drain(session);
        let joined = join_bounded_async(worker, self.options.join_timeout).await;
        self.complete_stop(id, joined)
    }

    fn begin_stop(&mut self) -> Result<ActiveSession, SessionError> {
        match (self.state, self.session.take()) {
            (EngineState::Capturing | EngineState::Paused, Some(session)) => {
                self.set_state(EngineState::Stopping);
                Ok(session)
            }
            (state, session) => {
                self.session = session;
                Err(SessionError::InvalidState {
                    action: "stop capture",
                    state,
                })
            }
        }
    }

    fn complete_stop(
        &mut self,
        id: Uuid,
        joined: JoinOutcome<WorkerOutcome>,
    ) -> Result<StopReport, SessionError> {
        let result = self.session_report(id, joined);
        self.stats.freeze();
        self.paused.store(false, Ordering::SeqCst);

        let stats = self.stats.snapshot();
        match &result {
            Ok(report) => {
                info!(
                    session_id = %report.session_id,
                    frames = stats.frames_captured,
                    dropped = stats.frames_dropped,
                    audio_units = stats.audio_units_written,
                    bytes = stats.file_size_bytes,
                    "Capture stopped"
                );
                let _ = self.status_tx.send(EngineStatus::Finished {
                    path: report.path.clone(),
                    stats,
                });
            }
            Err(e) => {
                error!("Capture stopped with error: {}", e);
                let _ = self.status_tx.send(EngineStatus::Error(e.to_string()));
            }
        }
        self.set_state(EngineState::Idle);
        result
    }

    /// Stop the sources and tell the worker to drain; returns the worker to join
    fn signal_drain(&self, mut session: ActiveSession) -> (Uuid, JoinHandle<WorkerOutcome>) {
        // sources first so nothing is enqueued after the drain begins
        session.video.stop();
        if let Some(audio) = session.audio.as_mut() {
            audio.stop();
        }
        let _ = session.signal_tx.send(WorkerSignal::Drain);
        (session.id, session.worker)
    }

    fn session_report(
        &self,
        id: Uuid,
        joined: JoinOutcome<WorkerOutcome>,
    ) -> Result<StopReport, SessionError> {
        let outcome = match joined {
            JoinOutcome::Finished(outcome) => outcome,
            JoinOutcome::Panicked => return Err(SessionError::WorkerPanicked),
            JoinOutcome::TimedOut(_) => {
                return Err(SessionError::WorkerTimeout(self.options.join_timeout))
            }
        };

        match outcome {
            WorkerOutcome::Finalized {
                summary,
                flush_error: None,
            } => Ok(StopReport {
                session_id: id,
                path: self.settings.output_path.clone(),
                summary,
                stats: self.stats.snapshot(),
            }),
            WorkerOutcome::Finalized {
                flush_error: Some(e),
                ..
            } => Err(e.into()),
            WorkerOutcome::Failed(e) => Err(e.into()),
            WorkerOutcome::Discarded => Err(SessionError::InvalidState {
                action: "finalize",
                state: EngineState::Stopping,
            }),
        }
    }

    /// Apply commands until stopped or `limit` elapses, logging progress,
    /// then stop the session
    pub async fn supervise(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<EngineCommand>,
        limit: Option<Duration>,
    ) -> Result<StopReport, SessionError> {
        if !matches!(self.state, EngineState::Capturing | EngineState::Paused) {
            return Err(SessionError::InvalidState {
                action: "supervise",
                state: self.state,
            });
        }

        let interval = self.options.stats_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut drops = DropRateMonitor::default();
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Pause) => {
                        if let Err(e) = self.pause() {
                            warn!("Ignoring pause: {}", e);
                        }
                    }
                    Some(EngineCommand::Resume) => {
                        if let Err(e) = self.resume() {
                            warn!("Ignoring resume: {}", e);
                        }
                    }
                    Some(EngineCommand::Stop) => {
                        info!("Stop requested");
                        break;
                    }
                    Some(EngineCommand::Shutdown) | None => {
                        info!("Shutdown requested");
                        break;
                    }
                },
                _ = &mut deadline => {
                    info!("Duration limit reached");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = self.stats.snapshot();
                    info!(
                        "Frames: {} | FPS: {:.1} | Dropped: {} | Size: {:.2} MB",
                        snapshot.frames_captured,
                        snapshot.average_fps,
                        snapshot.frames_dropped,
                        snapshot.file_size_mb()
                    );
                    if let Some(rate) = drops.observe(
                        std::time::Instant::now(),
                        snapshot.frames_captured,
                        snapshot.frames_dropped,
                    ) {
                        warn!(
                            drop_rate = format!("{:.1}%", rate * 100.0),
                            "High frame drop rate"
                        );
                    }
                    let _ = self.status_tx.send(EngineStatus::Progress(snapshot));
                }
            }
        }

        self.stop_capture_async().await
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("Engine dropped while capturing, finalizing");
            let (id, worker) = self.signal_drain(session);
            let joined = join_bounded(worker, self.options.join_timeout);
            if let Err(e) = self.session_report(id, joined) {
                error!("Failed to finalize on drop: {}", e);
            }
        }
    }
}

/// Create channels for engine communication
pub fn create_engine_channels() -> (
    mpsc::Sender<EngineCommand>,
    mpsc::Receiver<EngineCommand>,
    broadcast::Sender<EngineStatus>,
    broadcast::Receiver<EngineStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(16);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}
