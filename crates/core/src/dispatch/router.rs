use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::Mutex;

use super::{
    backend::{Backend, BackendState},
    context::{ContextHandler, ExecutionContext},
    job::{AudioInput, Job, JobOutput, MotionJob},
    transport::{spawn_dedicated_worker, MessageBus},
    BackendKind, PlatformCapabilities,
};
use crate::{
    pipeline::{LipSyncAudio, LipSyncPipeline, MotionOutput},
    AppConfig, LipSyncError, PcmBuffer, Result, WavDecoder,
};

/// Picks the most capable usable backend and sends jobs to it.
///
/// Backends are tried in [`BackendKind::PREFERENCE`] order; one the platform
/// does not support is skipped and one that fails to initialise is passed
/// over for the next. The first that comes up stays active until it is
/// terminated. Failed jobs are never retried.
pub struct ExecutionContextRouter {
    backends: Vec<Arc<Backend>>,
    capabilities: PlatformCapabilities,
    active: Mutex<Option<Arc<Backend>>>,
}

impl ExecutionContextRouter {
    pub fn new(capabilities: PlatformCapabilities) -> Self {
        Self {
            backends: Vec::new(),
            capabilities,
            active: Mutex::new(None),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backends.push(Arc::new(backend));
        self.backends.sort_by_key(|backend| backend.kind());
        self
    }

    /// Router with a dedicated worker thread (when the platform has one) and
    /// the calling task as fallback, both decoding WAV input.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn local(config: &AppConfig) -> Result<Self> {
        let pipeline = LipSyncPipeline::from_config(config);
        let router_config = &config.router;
        let context = || {
            Arc::new(ExecutionContext::new(pipeline.clone()).with_decoder(Arc::new(WavDecoder)))
        };

        let mut router = Self::new(router_config.capabilities)
            .with_backend(Backend::inline(BackendKind::MainThread, context()));

        if router_config.capabilities.supports(BackendKind::DedicatedWorker) {
            let bus = MessageBus::new(router_config.bus_capacity);
            let target = router_config.dedicated_worker_target.clone();
            match spawn_dedicated_worker(&bus, target.clone(), Arc::new(ContextHandler::new(context()))) {
                Ok(endpoint) => {
                    let backend = Backend::remote(BackendKind::DedicatedWorker, bus.connect(Some(target)))
                        .with_endpoint(endpoint)
                        .with_init_timeout(router_config.init_timeout());
                    router = router.with_backend(backend);
                }
                Err(err) => {
                    tracing::warn!(%err, "could not start dedicated worker");
                }
            }
        }

        Ok(router)
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    /// Kind of the backend currently serving jobs, if one has been selected.
    pub async fn active_kind(&self) -> Option<BackendKind> {
        self.active.lock().await.as_ref().map(|backend| backend.kind())
    }

    async fn select(&self) -> Result<Arc<Backend>> {
        // Held across initialisation so concurrent callers queue behind it.
        let mut active = self.active.lock().await;
        if let Some(backend) = active.as_ref() {
            if backend.state() != BackendState::Terminated {
                return Ok(Arc::clone(backend));
            }
            tracing::warn!(backend = ?backend.kind(), "active backend terminated, reselecting");
        }

        for backend in &self.backends {
            if !self.capabilities.supports(backend.kind()) {
                tracing::debug!(backend = ?backend.kind(), "backend not supported on this platform");
                continue;
            }
            if backend.state() == BackendState::Terminated {
                continue;
            }
            match backend.initialize().await {
                Ok(()) => {
                    tracing::info!(backend = ?backend.kind(), "selected execution backend");
                    *active = Some(Arc::clone(backend));
                    return Ok(Arc::clone(backend));
                }
                Err(err) => {
                    tracing::warn!(backend = ?backend.kind(), %err, "falling back to next backend");
                }
            }
        }

        *active = None;
        Err(LipSyncError::BackendUnavailable(
            "no execution backend could be initialised".to_string(),
        ))
    }

    /// Runs `job` on the selected backend.
    pub async fn dispatch(&self, job: Job) -> Result<JobOutput> {
        let backend = self.select().await?;
        backend.execute(job).await
    }

    /// Like [`dispatch`](Self::dispatch) but gives up after `timeout`. The job
    /// keeps running in the background and its result is discarded.
    pub async fn dispatch_with_timeout(self: &Arc<Self>, job: Job, timeout: Duration) -> Result<JobOutput> {
        let router = Arc::clone(self);
        let task = tokio::spawn(async move { router.dispatch(job).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(LipSyncError::Dispatch(format!("dispatch task failed: {err}"))),
            Err(_) => {
                tracing::warn!(?timeout, "dispatch timed out, discarding job");
                Err(LipSyncError::Timeout(timeout))
            }
        }
    }

    pub async fn generate_motion(&self, pcm: PcmBuffer, model_name: &str, convert: bool) -> Result<MotionOutput> {
        self.dispatch(Job::GenerateMotion(MotionJob {
            audio: AudioInput::Pcm(pcm),
            model_name: model_name.to_string(),
            convert,
        }))
        .await?
        .into_motion()
    }

    /// Attaches motion to encoded `audio`. Never fails: on any error the
    /// audio comes back alone so playback is not held up.
    pub async fn audio_with_lip_sync(&self, audio: Bytes, model_name: &str) -> LipSyncAudio {
        let job = Job::GenerateMotion(MotionJob {
            audio: AudioInput::Encoded(audio.clone()),
            model_name: model_name.to_string(),
            convert: true,
        });

        match self.dispatch(job).await.and_then(JobOutput::into_motion) {
            Ok(motion) => LipSyncAudio {
                audio,
                motion: Some(motion),
            },
            Err(err) => {
                tracing::warn!(%err, "lip sync failed, returning audio without motion");
                LipSyncAudio::audio_only(audio)
            }
        }
    }

    /// Synthesises `text` and attaches motion to the result. Only the speech
    /// step can fail.
    pub async fn speak_with_lip_sync(&self, text: &str, model_name: &str) -> Result<LipSyncAudio> {
        let audio = self
            .dispatch(Job::SynthesizeSpeech {
                text: text.to_string(),
            })
            .await?
            .into_speech()?;
        Ok(self.audio_with_lip_sync(audio, model_name).await)
    }

    /// Terminates every backend.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        *active = None;
        for backend in &self.backends {
            backend.terminate();
        }
    }
}

impl std::fmt::Debug for ExecutionContextRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContextRouter")
            .field("backends", &self.backends)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
