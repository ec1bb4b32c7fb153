//! # Text-to-Speech Handler
//!
//! `POST /api/v1/tts` reads a reply aloud with the hosted speech model.
//!
//! ## Formats:
//! - `pcm` (default): JSON with base64 raw 16-bit PCM, 24kHz mono
//! - `wav`: the same samples as an `audio/wav` file

use crate::audio::pcm::{pcm_mime_type, AudioFrame, OUTPUT_SAMPLE_RATE};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechFormat {
    #[default]
    Pcm,
    Wav,
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default)]
    pub format: SpeechFormat,
}

pub async fn synthesize(
    state: web::Data<AppState>,
    body: web::Json<SpeechRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::ValidationError("Text must not be empty".to_string()));
    }

    let Some(data) = state.genai_client().synthesize_speech(&request.text).await? else {
        warn!("Speech model returned no audio");
        return Err(AppError::Upstream {
            kind: "tts_unavailable",
            message: "The speech model returned no audio".to_string(),
        });
    };

    let frame = AudioFrame::from_base64(&data, OUTPUT_SAMPLE_RATE, 1)?;
    info!(
        format = ?request.format,
        duration_secs = frame.duration(),
        "Speech synthesized"
    );

    match request.format {
        SpeechFormat::Pcm => Ok(HttpResponse::Ok().json(json!({
            "mime_type": pcm_mime_type(frame.sample_rate()),
            "sample_rate": frame.sample_rate(),
            "channels": frame.channels(),
            "duration": frame.duration(),
            "data": data
        }))),
        SpeechFormat::Wav => Ok(HttpResponse::Ok()
            .content_type("audio/wav")
            .body(encode_wav(&frame)?)),
    }
}

/// 16-bit PCM WAV file for a frame.
pub fn encode_wav(frame: &AudioFrame) -> AppResult<Vec<u8>> {
    let header = wav::Header::new(
        wav::header::WAV_FORMAT_PCM,
        frame.channels(),
        frame.sample_rate(),
        16,
    );
    let track = wav::BitDepth::Sixteen(frame.samples().to_vec());

    let mut out = Cursor::new(Vec::new());
    wav::write(header, &track, &mut out)
        .map_err(|e| AppError::Internal(format!("Failed to encode WAV: {}", e)))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::genai::test_support::StubModel;
    use crate::handlers::configure_api;
    use crate::state::test_support::temp_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use base64::Engine;

    #[actix_web::test]
    async fn test_wav_header_and_size() {
        let frame = AudioFrame::new(vec![0, 1000, -1000, 32767], OUTPUT_SAMPLE_RATE, 1).unwrap();
        let bytes = encode_wav(&frame).unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]), 24_000);
        assert!(bytes.ends_with(&frame.to_le_bytes()));
    }

    #[actix_web::test]
    async fn test_format_defaults_to_pcm() {
        let request: SpeechRequest = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(request.format, SpeechFormat::Pcm);
        let request: SpeechRequest = serde_json::from_str(r#"{"text": "hi", "format": "wav"}"#).unwrap();
        assert_eq!(request.format, SpeechFormat::Wav);
    }

    #[actix_web::test]
    async fn test_empty_text_is_rejected() {
        let (_dir, state) = temp_state(AppConfig::default());
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(configure_api)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/tts")
            .set_json(serde_json::json!({ "text": "" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_speech_is_returned_as_pcm_and_wav() {
        let samples = AudioFrame::new(vec![0, 8192, -8192, 0], OUTPUT_SAMPLE_RATE, 1).unwrap();
        let data = base64::engine::general_purpose::STANDARD.encode(samples.to_le_bytes());
        let stub = StubModel::start(serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } }] }
            }]
        }));
        let mut config = AppConfig::default();
        config.genai.api_key = "test-key".to_string();
        config.genai.base_url = stub.base_url.clone();
        let (_dir, state) = temp_state(config);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(configure_api)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/tts")
            .set_json(serde_json::json!({ "text": "Hello there" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"], data.as_str());
        assert_eq!(body["sample_rate"], 24_000);
        assert_eq!(body["channels"], 1);

        let req = test::TestRequest::post()
            .uri("/api/v1/tts")
            .set_json(serde_json::json!({ "text": "Hello there", "format": "wav" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "audio/wav");
        let wav = test::read_body(resp).await;
        assert_eq!(&wav[0..4], b"RIFF");
        assert!(wav.ends_with(&samples.to_le_bytes()));

        let calls = stub.calls();
        assert_eq!(calls[0].body["contents"][0]["parts"][0]["text"], "Hello there");
        assert_eq!(calls[0].body["generationConfig"]["responseModalities"], serde_json::json!(["AUDIO"]));

        stub.stop().await;
    }
}
