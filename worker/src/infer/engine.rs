use image::RgbImage;
use tch::TchError;

use shared::{CLASS_COUNT, PredictionResult, Probabilities};

use crate::infer::model::TurbidityModel;
use crate::infer::preprocess;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Torch error: {0}")]
    Torch(#[from] TchError),
    #[error("Model produced {0} outputs, expected {CLASS_COUNT}")]
    UnexpectedOutput(usize),
}

/// Composes the preprocessing pipeline with the loaded model. Owns the model
/// for the lifetime of the process; read-only per request.
pub struct InferenceEngine {
    model: TurbidityModel,
}

impl InferenceEngine {
    pub fn new(model: TurbidityModel) -> Self {
        Self { model }
    }

    /// Classify one decoded RGB image. Errors propagate to the protocol loop
    /// where they become per-request error responses.
    pub fn classify(&self, image: &RgbImage) -> Result<PredictionResult, InferenceError> {
        let input = preprocess::pipeline(image).unsqueeze(0);
        let output = self.model.infer(&input)?;
        let values: [f32; CLASS_COUNT] = output
            .try_into()
            .map_err(|v: Vec<f32>| InferenceError::UnexpectedOutput(v.len()))?;

        let probabilities = Probabilities(values);
        let class = probabilities.argmax();
        Ok(PredictionResult {
            class,
            confidence: probabilities.get(class),
            probabilities,
            ntu_range: class.ntu_range(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tch::Device;

    fn untrained_engine() -> InferenceEngine {
        InferenceEngine::new(TurbidityModel::build(Device::Cpu, None).unwrap())
    }

    #[test]
    fn classification_is_internally_consistent() {
        let engine = untrained_engine();
        let image = RgbImage::from_pixel(64, 48, Rgb([90, 120, 150]));
        let result = engine.classify(&image).unwrap();

        // The winning class carries the max probability and its static range.
        assert_eq!(result.class, result.probabilities.argmax());
        assert_eq!(result.confidence, result.probabilities.get(result.class));
        assert_eq!(result.ntu_range, result.class.ntu_range());

        let sum: f32 = result.probabilities.0.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn repeated_classification_is_bit_identical() {
        let engine = untrained_engine();
        let image = RgbImage::from_pixel(33, 71, Rgb([7, 200, 13]));
        let first = engine.classify(&image).unwrap();
        let second = engine.classify(&image).unwrap();
        assert_eq!(first.probabilities, second.probabilities);
        assert_eq!(first.class, second.class);
    }
}
