use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::envelope::{DispatchRequest, DispatchResponse, JobType};
use crate::{
    pipeline::{ConversionStatus, MotionOutput},
    LipSyncError, PcmBuffer, Result,
};

/// Audio handed to a motion job.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioInput {
    /// Already decoded samples.
    Pcm(PcmBuffer),
    /// Container bytes (for example WAV) that need a decoder.
    Encoded(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionJob {
    pub audio: AudioInput,
    pub model_name: String,
    /// Run the secondary converter on the result when one is available.
    pub convert: bool,
}

/// Unit of work executed by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Initialize,
    GenerateMotion(MotionJob),
    ConvertMotion { vmd: Bytes },
    SynthesizeSpeech { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Initialized,
    Motion(MotionOutput),
    Speech(Bytes),
}

impl JobOutput {
    pub fn into_motion(self) -> Result<MotionOutput> {
        match self {
            JobOutput::Motion(output) => Ok(output),
            other => Err(LipSyncError::Dispatch(format!(
                "expected motion output, got {other:?}"
            ))),
        }
    }

    pub fn into_speech(self) -> Result<Bytes> {
        match self {
            JobOutput::Speech(audio) => Ok(audio),
            other => Err(LipSyncError::Dispatch(format!(
                "expected speech output, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum AudioFormat {
    PcmF32le,
    Encoded,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateMotionData {
    model_name: String,
    audio_format: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(default)]
    convert: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SynthesizeSpeechData {
    text: String,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        match self {
            Job::Initialize => JobType::Initialize,
            Job::GenerateMotion(_) => JobType::GenerateMotion,
            Job::ConvertMotion { .. } => JobType::ConvertMotion,
            Job::SynthesizeSpeech { .. } => JobType::SynthesizeSpeech,
        }
    }

    /// Splits the job into a JSON body and binary attachments.
    pub fn into_parts(self) -> Result<(JobType, Value, Vec<Bytes>)> {
        let job_type = self.job_type();
        let parts = match self {
            Job::Initialize => (Value::Null, Vec::new()),
            Job::GenerateMotion(job) => {
                let (audio_format, sample_rate, payload) = match job.audio {
                    AudioInput::Pcm(pcm) => (
                        AudioFormat::PcmF32le,
                        Some(pcm.sample_rate()),
                        pcm.to_f32_le_bytes(),
                    ),
                    AudioInput::Encoded(bytes) => (AudioFormat::Encoded, None, bytes),
                };
                let data = GenerateMotionData {
                    model_name: job.model_name,
                    audio_format,
                    sample_rate,
                    convert: job.convert,
                };
                (serde_json::to_value(data)?, vec![payload])
            }
            Job::ConvertMotion { vmd } => (json!({}), vec![vmd]),
            Job::SynthesizeSpeech { text } => {
                (serde_json::to_value(SynthesizeSpeechData { text })?, Vec::new())
            }
        };
        Ok((job_type, parts.0, parts.1))
    }

    /// Rebuilds a job from an incoming request.
    pub fn from_request(request: DispatchRequest) -> Result<Self> {
        match request.job_type {
            JobType::Initialize => Ok(Job::Initialize),
            JobType::GenerateMotion => {
                let data: GenerateMotionData = serde_json::from_value(request.data)?;
                let payload = first_attachment(request.attachments, "audio")?;
                let audio = match data.audio_format {
                    AudioFormat::PcmF32le => {
                        let sample_rate = data.sample_rate.ok_or_else(|| {
                            LipSyncError::invalid("raw PCM audio requires a sample rate")
                        })?;
                        AudioInput::Pcm(PcmBuffer::from_f32_le(&payload, sample_rate)?)
                    }
                    AudioFormat::Encoded => AudioInput::Encoded(payload),
                };
                Ok(Job::GenerateMotion(MotionJob {
                    audio,
                    model_name: data.model_name,
                    convert: data.convert,
                }))
            }
            JobType::ConvertMotion => Ok(Job::ConvertMotion {
                vmd: first_attachment(request.attachments, "motion")?,
            }),
            JobType::SynthesizeSpeech => {
                let data: SynthesizeSpeechData = serde_json::from_value(request.data)?;
                Ok(Job::SynthesizeSpeech { text: data.text })
            }
        }
    }
}

impl JobOutput {
    pub fn into_response(self, request_id: impl Into<String>) -> Result<DispatchResponse> {
        let request_id = request_id.into();
        Ok(match self {
            JobOutput::Initialized => DispatchResponse::success(request_id, json!({}), Vec::new()),
            JobOutput::Motion(output) => {
                let mut attachments = vec![output.vmd];
                attachments.extend(output.converted);
                DispatchResponse::success(
                    request_id,
                    json!({ "conversion": serde_json::to_value(&output.conversion)? }),
                    attachments,
                )
            }
            JobOutput::Speech(audio) => DispatchResponse::success(request_id, json!({}), vec![audio]),
        })
    }

    /// Interprets a successful response to a request of type `job_type`.
    pub fn from_response(job_type: JobType, response: DispatchResponse) -> Result<Self> {
        let response = response.into_result()?;
        match job_type {
            JobType::Initialize => Ok(JobOutput::Initialized),
            JobType::GenerateMotion | JobType::ConvertMotion => {
                let conversion: ConversionStatus = response
                    .data
                    .as_ref()
                    .and_then(|data| data.get("conversion"))
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or(ConversionStatus::NotRequested);
                let mut attachments = response.attachments.into_iter();
                let vmd = attachments
                    .next()
                    .ok_or_else(|| LipSyncError::Dispatch("motion reply carried no data".to_string()))?;
                Ok(JobOutput::Motion(MotionOutput {
                    vmd,
                    converted: attachments.next(),
                    conversion,
                }))
            }
            JobType::SynthesizeSpeech => Ok(JobOutput::Speech(first_attachment(
                response.attachments,
                "speech",
            )?)),
        }
    }
}

fn first_attachment(attachments: Vec<Bytes>, what: &str) -> Result<Bytes> {
    attachments
        .into_iter()
        .next()
        .ok_or_else(|| LipSyncError::invalid(format!("message is missing its {what} payload")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_request(job: Job) -> DispatchRequest {
        let (job_type, data, attachments) = job.into_parts().unwrap();
        let mut request = DispatchRequest::new(job_type, data);
        request.attachments = attachments;
        request
    }

    #[test]
    fn pcm_motion_jobs_cross_the_envelope() {
        let pcm = PcmBuffer::new(vec![0.5, -0.25, 0.0], 24_000).unwrap();
        let job = Job::GenerateMotion(MotionJob {
            audio: AudioInput::Pcm(pcm),
            model_name: "model".to_string(),
            convert: true,
        });

        let request = to_request(job.clone());
        assert_eq!(request.data["audioFormat"], "pcmF32le");
        assert_eq!(request.data["sampleRate"], 24_000);
        assert_eq!(Job::from_request(request).unwrap(), job);
    }

    #[test]
    fn encoded_audio_needs_no_sample_rate() {
        let job = Job::GenerateMotion(MotionJob {
            audio: AudioInput::Encoded(Bytes::from_static(b"RIFF")),
            model_name: "model".to_string(),
            convert: false,
        });

        let request = to_request(job.clone());
        assert!(request.data.get("sampleRate").is_none());
        assert_eq!(Job::from_request(request).unwrap(), job);
    }

    #[test]
    fn missing_payload_is_invalid_input() {
        let mut request = to_request(Job::ConvertMotion {
            vmd: Bytes::from_static(b"vmd"),
        });
        request.attachments.clear();

        assert!(matches!(
            Job::from_request(request),
            Err(LipSyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn motion_output_survives_the_response() {
        let output = MotionOutput {
            vmd: Bytes::from_static(b"vmd"),
            converted: None,
            conversion: ConversionStatus::Skipped {
                reason: "no converter".to_string(),
            },
        };
        let response = JobOutput::Motion(output.clone()).into_response("id").unwrap();
        assert_eq!(response.data.as_ref().unwrap()["conversion"]["status"], "skipped");

        let restored = JobOutput::from_response(JobType::GenerateMotion, response).unwrap();
        assert_eq!(restored, JobOutput::Motion(output));
    }

    #[test]
    fn error_envelopes_become_dispatch_errors() {
        let response = DispatchResponse::error("id", "decoder exploded");
        let err = JobOutput::from_response(JobType::GenerateMotion, response).unwrap_err();

        assert!(err.to_string().contains("decoder exploded"));
    }
}
