use std::io::{self, BufRead, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, error, info};
use tch::Device;

use shared::{InferenceRequest, PredictionResult, WorkerResponse};

use crate::infer::engine::{InferenceEngine, InferenceError};
use crate::infer::preprocess;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Model not loaded")]
    ModelNotLoaded,
    #[error("No image_base64 provided")]
    MissingImage,
    #[error("Invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Could not decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
}

pub fn device_name(device: Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(index) => format!("cuda:{}", index),
        other => format!("{:?}", other).to_lowercase(),
    }
}

/// The serving side of the worker: an optional engine (None when the weight
/// file was missing at startup) plus the device reported in the ready line.
pub struct Worker {
    engine: Option<InferenceEngine>,
    device: Device,
}

impl Worker {
    pub fn new(engine: Option<InferenceEngine>, device: Device) -> Self {
        Self { engine, device }
    }

    /// Serve line-delimited JSON requests until the input stream closes.
    /// Emits the ready line first, then exactly one response per non-blank
    /// input line. A failed request never takes down the loop.
    pub fn serve<R: BufRead, W: Write>(&self, input: R, output: &mut W) -> io::Result<()> {
        self.send(
            output,
            &WorkerResponse::Ready {
                ready: true,
                model_loaded: self.engine.is_some(),
                device: device_name(self.device),
            },
        )?;

        for line in input.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_line(line);
            self.send(output, &response)?;
        }

        info!("Input stream closed, shutting down");
        Ok(())
    }

    fn handle_line(&self, line: &str) -> WorkerResponse {
        let request: InferenceRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => return WorkerResponse::error("unknown", format!("Invalid JSON: {}", e)),
        };
        let id = request.id.clone().unwrap_or_else(|| "unknown".to_string());

        match self.predict(&request) {
            Ok(result) => {
                debug!("Request {} classified as {}", id, result.class);
                WorkerResponse::success(id, result)
            }
            Err(e) => {
                error!("Request {} failed: {}", id, e);
                WorkerResponse::error(id, e.to_string())
            }
        }
    }

    fn predict(&self, request: &InferenceRequest) -> Result<PredictionResult, RequestError> {
        let engine = self.engine.as_ref().ok_or(RequestError::ModelNotLoaded)?;
        if request.image_base64.is_empty() {
            return Err(RequestError::MissingImage);
        }
        let bytes = BASE64.decode(&request.image_base64)?;
        let image = preprocess::decode_rgb(&bytes)?;
        Ok(engine.classify(&image)?)
    }

    fn send<W: Write>(&self, output: &mut W, response: &WorkerResponse) -> io::Result<()> {
        let line = serde_json::to_string(response)?;
        writeln!(output, "{}", line)?;
        output.flush()
    }
}
