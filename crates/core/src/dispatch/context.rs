use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;

use super::{
    envelope::{DispatchRequest, DispatchResponse},
    job::{AudioInput, Job, JobOutput, MotionJob},
    transport::RequestHandler,
};
use crate::{
    pipeline::{
        ConversionStatus, LipSyncPipeline, MotionOutput, SceneHandle, SecondaryConverter,
        SpeechSynthesizer,
    },
    BinaryMotionCodec, LipSyncError, PcmBuffer, PcmDecoder, Result,
};

/// Everything one backend needs to run jobs: the pipeline and whichever
/// collaborators the hosting environment provides.
pub struct ExecutionContext {
    pipeline: LipSyncPipeline,
    decoder: Option<Arc<dyn PcmDecoder>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    converter: Option<Arc<dyn SecondaryConverter>>,
    scene: OnceCell<Option<SceneHandle>>,
}

impl ExecutionContext {
    pub fn new(pipeline: LipSyncPipeline) -> Self {
        Self {
            pipeline,
            decoder: None,
            synthesizer: None,
            converter: None,
            scene: OnceCell::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn PcmDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn SecondaryConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn pipeline(&self) -> &LipSyncPipeline {
        &self.pipeline
    }

    /// Loads collaborator state. A failing speech model fails initialisation;
    /// a failing scene only disables secondary conversion.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(synthesizer) = &self.synthesizer {
            synthesizer.load().await?;
        }
        self.scene().await;
        Ok(())
    }

    pub async fn run(&self, job: Job) -> Result<JobOutput> {
        match job {
            Job::Initialize => {
                self.initialize().await?;
                Ok(JobOutput::Initialized)
            }
            Job::GenerateMotion(job) => self.generate_motion(job).await.map(JobOutput::Motion),
            Job::ConvertMotion { vmd } => {
                BinaryMotionCodec::deserialize(&vmd)?;
                Ok(JobOutput::Motion(self.convert(vmd).await))
            }
            Job::SynthesizeSpeech { text } => self.synthesize(&text).await.map(JobOutput::Speech),
        }
    }

    async fn generate_motion(&self, job: MotionJob) -> Result<MotionOutput> {
        let pcm = self.decode(job.audio).await?;
        let model_name = if job.model_name.is_empty() {
            self.pipeline.default_model_name().to_string()
        } else {
            job.model_name
        };

        let vmd = self.pipeline.generate_motion(&pcm, &model_name).await?;
        if job.convert {
            Ok(self.convert(vmd).await)
        } else {
            Ok(MotionOutput::unconverted(vmd))
        }
    }

    async fn decode(&self, audio: AudioInput) -> Result<PcmBuffer> {
        match audio {
            AudioInput::Pcm(pcm) => Ok(pcm),
            AudioInput::Encoded(bytes) => match &self.decoder {
                Some(decoder) => decoder.decode(&bytes).await,
                None => Err(LipSyncError::BackendUnavailable(
                    "no audio decoder in this execution context".to_string(),
                )),
            },
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        if text.trim().is_empty() {
            return Err(LipSyncError::invalid("cannot synthesise empty text"));
        }
        match &self.synthesizer {
            Some(synthesizer) => synthesizer.synthesize(text).await,
            None => Err(LipSyncError::BackendUnavailable(
                "no speech synthesizer in this execution context".to_string(),
            )),
        }
    }

    /// Runs the secondary converter when possible. Never fails: a missing or
    /// failing converter yields the plain buffer marked as skipped.
    async fn convert(&self, vmd: Bytes) -> MotionOutput {
        let skipped = |reason: String| MotionOutput {
            vmd: vmd.clone(),
            converted: None,
            conversion: ConversionStatus::Skipped { reason },
        };

        let (Some(converter), Some(scene)) = (&self.converter, self.scene().await) else {
            let err = LipSyncError::SecondaryConversionUnavailable(
                "no converter in this execution context".to_string(),
            );
            tracing::debug!(%err, "returning unconverted motion");
            return skipped(err.to_string());
        };

        // The converter may hold on to its input; give it its own copy.
        let source = Bytes::copy_from_slice(&vmd);
        match converter.convert(source, scene).await {
            Ok(converted) => MotionOutput {
                vmd: vmd.clone(),
                converted: Some(converted),
                conversion: ConversionStatus::Converted,
            },
            Err(err) => {
                tracing::warn!(%err, "secondary conversion failed, returning unconverted motion");
                skipped(err.to_string())
            }
        }
    }

    async fn scene(&self) -> Option<&SceneHandle> {
        self.scene
            .get_or_init(|| async {
                let converter = self.converter.as_ref()?;
                match converter.create_scene().await {
                    Ok(scene) => Some(scene),
                    Err(err) => {
                        tracing::warn!(%err, "scene setup failed, secondary conversion disabled");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pipeline", &self.pipeline)
            .field("decoder", &self.decoder.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

/// Serves an [`ExecutionContext`] behind a message endpoint.
#[derive(Debug, Clone)]
pub struct ContextHandler {
    context: Arc<ExecutionContext>,
}

impl ContextHandler {
    pub fn new(context: Arc<ExecutionContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl RequestHandler for ContextHandler {
    async fn handle(&self, request: DispatchRequest) -> DispatchResponse {
        let request_id = request.request_id.clone();
        let job_type = request.job_type;
        tracing::debug!(request_id = %request_id, ?job_type, "handling request");

        let outcome = match Job::from_request(request) {
            Ok(job) => self.context.run(job).await,
            Err(err) => Err(err),
        };
        let response = outcome.and_then(|output| output.into_response(request_id.clone()));

        match response {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(request_id = %request_id, %err, "request failed");
                DispatchResponse::error(request_id, err.to_string())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{audio::wav_bytes, JobType, WavDecoder};

    /// Converter that records the buffers it was handed.
    #[derive(Default)]
    pub(crate) struct RecordingConverter {
        pub(crate) seen: Mutex<Vec<Bytes>>,
        pub(crate) scenes: AtomicUsize,
    }

    #[async_trait]
    impl SecondaryConverter for RecordingConverter {
        async fn create_scene(&self) -> Result<SceneHandle> {
            let id = self.scenes.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(SceneHandle(id))
        }

        async fn convert(&self, source: Bytes, _scene: &SceneHandle) -> Result<Bytes> {
            let converted = Bytes::from(format!("bvmd:{}", source.len()));
            self.seen.lock().unwrap().push(source);
            Ok(converted)
        }
    }

    pub(crate) struct FailingSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for FailingSynthesizer {
        async fn load(&self) -> Result<()> {
            Err(LipSyncError::msg("model weights missing"))
        }

        async fn synthesize(&self, _text: &str) -> Result<Bytes> {
            Err(LipSyncError::msg("model not loaded"))
        }
    }

    fn silent_job(convert: bool) -> Job {
        Job::GenerateMotion(MotionJob {
            audio: AudioInput::Pcm(PcmBuffer::new(vec![0.0; 12_000], 24_000).unwrap()),
            model_name: String::new(),
            convert,
        })
    }

    #[tokio::test]
    async fn missing_converter_is_reported_not_raised() {
        let context = ExecutionContext::new(LipSyncPipeline::default());
        let output = context.run(silent_job(true)).await.unwrap().into_motion().unwrap();

        assert!(output.conversion_skipped());
        assert!(output.converted.is_none());
        let document = BinaryMotionCodec::deserialize(&output.vmd).unwrap();
        assert_eq!(document.model_name, "lipsync");
    }

    #[tokio::test]
    async fn converter_gets_a_private_copy() {
        let converter = Arc::new(RecordingConverter::default());
        let context = ExecutionContext::new(LipSyncPipeline::default()).with_converter(converter.clone());

        let output = context.run(silent_job(true)).await.unwrap().into_motion().unwrap();
        assert_eq!(output.conversion, ConversionStatus::Converted);

        let seen = converter.seen.lock().unwrap();
        assert_eq!(seen[0], output.vmd);
        assert_ne!(seen[0].as_ptr(), output.vmd.as_ptr());
    }

    #[tokio::test]
    async fn scene_is_created_once() {
        let converter = Arc::new(RecordingConverter::default());
        let context = ExecutionContext::new(LipSyncPipeline::default()).with_converter(converter.clone());

        context.initialize().await.unwrap();
        context.run(silent_job(true)).await.unwrap();
        context.run(silent_job(true)).await.unwrap();
        assert_eq!(converter.scenes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn encoded_audio_needs_a_decoder() {
        let wav = Bytes::from(wav_bytes(&[0.0; 2_400], 24_000));
        let job = Job::GenerateMotion(MotionJob {
            audio: AudioInput::Encoded(wav),
            model_name: "m".to_string(),
            convert: false,
        });

        let bare = ExecutionContext::new(LipSyncPipeline::default());
        assert!(matches!(
            bare.run(job.clone()).await,
            Err(LipSyncError::BackendUnavailable(_))
        ));

        let decoding = ExecutionContext::new(LipSyncPipeline::default()).with_decoder(Arc::new(WavDecoder));
        assert!(decoding.run(job).await.is_ok());
    }

    #[tokio::test]
    async fn failing_speech_model_fails_initialisation() {
        let context = ExecutionContext::new(LipSyncPipeline::default())
            .with_synthesizer(Arc::new(FailingSynthesizer));
        assert!(context.initialize().await.is_err());
    }

    #[tokio::test]
    async fn handler_answers_with_the_request_id() {
        let handler = ContextHandler::new(Arc::new(ExecutionContext::new(LipSyncPipeline::default())));

        let ok = handler
            .handle(DispatchRequest::new(JobType::Initialize, serde_json::Value::Null))
            .await;
        assert!(ok.is_success());

        let bad = DispatchRequest::new(JobType::GenerateMotion, serde_json::json!({ "bogus": 1 }));
        let id = bad.request_id.clone();
        let reply = handler.handle(bad).await;
        assert!(!reply.is_success());
        assert_eq!(reply.request_id, id);
    }

    #[tokio::test]
    async fn convert_job_rejects_garbage() {
        let context = ExecutionContext::new(LipSyncPipeline::default());
        let result = context
            .run(Job::ConvertMotion {
                vmd: Bytes::from_static(b"garbage"),
            })
            .await;
        assert!(matches!(result, Err(LipSyncError::TruncatedData { .. })));
    }
}
