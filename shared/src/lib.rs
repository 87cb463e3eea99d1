use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

pub const CLASS_COUNT: usize = 6;

/// Turbidity categories in model output order, most turbid first.
///
/// The declaration order is the canonical index-to-label mapping: it must
/// match the order the classifier head was trained with, and it is the order
/// the probability map is written in on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
pub enum ClassLabel {
    #[serde(rename = "ultra cloudy")]
    #[strum(serialize = "ultra cloudy")]
    UltraCloudy,
    #[serde(rename = "very cloudy")]
    #[strum(serialize = "very cloudy")]
    VeryCloudy,
    #[serde(rename = "cloudy")]
    #[strum(serialize = "cloudy")]
    Cloudy,
    #[serde(rename = "lightly cloudy")]
    #[strum(serialize = "lightly cloudy")]
    LightlyCloudy,
    #[serde(rename = "lightly clear")]
    #[strum(serialize = "lightly clear")]
    LightlyClear,
    #[serde(rename = "clear")]
    #[strum(serialize = "clear")]
    Clear,
}

impl ClassLabel {
    pub fn from_index(index: usize) -> Option<ClassLabel> {
        ClassLabel::iter().nth(index)
    }

    /// Static NTU bounds for each class. Domain metadata used for reporting,
    /// not derived from model output.
    pub fn ntu_range(self) -> TurbidityRange {
        match self {
            ClassLabel::UltraCloudy => TurbidityRange { min: 3336.0, max: 3844.0 },
            ClassLabel::VeryCloudy => TurbidityRange { min: 1300.0, max: 2520.0 },
            ClassLabel::Cloudy => TurbidityRange { min: 600.0, max: 1200.0 },
            ClassLabel::LightlyCloudy => TurbidityRange { min: 150.0, max: 450.0 },
            ClassLabel::LightlyClear => TurbidityRange { min: 25.0, max: 90.0 },
            ClassLabel::Clear => TurbidityRange { min: 1.47, max: 17.13 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurbidityRange {
    pub min: f64,
    pub max: f64,
}

/// Probability for every class, indexed in `ClassLabel` order.
/// Serializes as a JSON object keyed by label, in that same order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probabilities(pub [f32; CLASS_COUNT]);

impl Probabilities {
    pub fn argmax(&self) -> ClassLabel {
        let mut best = 0;
        for i in 1..CLASS_COUNT {
            if self.0[i] > self.0[best] {
                best = i;
            }
        }
        ClassLabel::from_index(best).unwrap_or(ClassLabel::UltraCloudy)
    }

    pub fn get(&self, label: ClassLabel) -> f32 {
        self.0[label as usize]
    }
}

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CLASS_COUNT))?;
        for (label, probability) in ClassLabel::iter().zip(self.0.iter()) {
            map.serialize_entry(&label, probability)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub class: ClassLabel,
    pub confidence: f32,
    pub probabilities: Probabilities,
    pub ntu_range: TurbidityRange,
}

/// One request line from the orchestrator. `id` is opaque and echoed back
/// verbatim; a request without one is answered under the id "unknown".
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    pub id: Option<String>,
    #[serde(default)]
    pub image_base64: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse {
    pub id: String,
    #[serde(flatten)]
    pub result: PredictionResult,
}

/// Every line the worker writes to stdout: the one-time ready signal, then
/// exactly one success or error per request line.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    Ready {
        ready: bool,
        model_loaded: bool,
        device: String,
    },
    Success(SuccessResponse),
    Error {
        id: String,
        error: String,
    },
}

impl WorkerResponse {
    pub fn success(id: impl Into<String>, result: PredictionResult) -> Self {
        WorkerResponse::Success(SuccessResponse { id: id.into(), result })
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        WorkerResponse::Error {
            id: id.into(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_ordered_most_turbid_first() {
        let labels: Vec<ClassLabel> = ClassLabel::iter().collect();
        assert_eq!(labels.len(), CLASS_COUNT);
        assert_eq!(labels[0], ClassLabel::UltraCloudy);
        assert_eq!(labels[5], ClassLabel::Clear);
    }

    #[test]
    fn label_index_round_trip() {
        for (i, label) in ClassLabel::iter().enumerate() {
            assert_eq!(label as usize, i);
            assert_eq!(ClassLabel::from_index(i), Some(label));
        }
        assert_eq!(ClassLabel::from_index(CLASS_COUNT), None);
    }

    #[test]
    fn labels_serialize_as_wire_strings() {
        assert_eq!(
            serde_json::to_string(&ClassLabel::UltraCloudy).unwrap(),
            "\"ultra cloudy\""
        );
        assert_eq!(
            serde_json::to_string(&ClassLabel::LightlyClear).unwrap(),
            "\"lightly clear\""
        );
        assert_eq!(serde_json::to_string(&ClassLabel::Clear).unwrap(), "\"clear\"");
    }

    #[test]
    fn labels_display_with_the_same_wire_strings() {
        assert_eq!(ClassLabel::UltraCloudy.to_string(), "ultra cloudy");
        assert_eq!(ClassLabel::VeryCloudy.to_string(), "very cloudy");
        assert_eq!(ClassLabel::LightlyClear.to_string(), "lightly clear");
        assert_eq!(ClassLabel::Clear.to_string(), "clear");
    }

    #[test]
    fn ntu_ranges_do_not_overlap_and_decrease_with_clarity() {
        assert_eq!(
            ClassLabel::UltraCloudy.ntu_range(),
            TurbidityRange { min: 3336.0, max: 3844.0 }
        );
        assert_eq!(
            ClassLabel::Clear.ntu_range(),
            TurbidityRange { min: 1.47, max: 17.13 }
        );

        let ranges: Vec<TurbidityRange> = ClassLabel::iter().map(|l| l.ntu_range()).collect();
        for pair in ranges.windows(2) {
            assert!(pair[1].max < pair[0].min);
        }
    }

    #[test]
    fn probabilities_argmax_picks_the_largest_entry() {
        let probs = Probabilities([0.1, 0.05, 0.6, 0.1, 0.1, 0.05]);
        assert_eq!(probs.argmax(), ClassLabel::Cloudy);
        assert_eq!(probs.get(ClassLabel::Cloudy), 0.6);
    }

    #[test]
    fn probabilities_serialize_in_label_order() {
        let probs = Probabilities([0.5, 0.1, 0.1, 0.1, 0.1, 0.1]);
        let json = serde_json::to_string(&probs).unwrap();
        let keys = [
            "\"ultra cloudy\"",
            "\"very cloudy\"",
            "\"cloudy\"",
            "\"lightly cloudy\"",
            "\"lightly clear\"",
            "\"clear\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| json.find(k).unwrap()).collect();
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn ready_and_error_responses_match_the_wire_shape() {
        let ready = WorkerResponse::Ready {
            ready: true,
            model_loaded: false,
            device: "cpu".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&ready).unwrap(),
            r#"{"ready":true,"model_loaded":false,"device":"cpu"}"#
        );

        let error = WorkerResponse::error("req-1", "boom");
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"id":"req-1","error":"boom"}"#
        );
    }

    #[test]
    fn success_response_flattens_the_prediction() {
        let probs = Probabilities([0.7, 0.1, 0.05, 0.05, 0.05, 0.05]);
        let class = probs.argmax();
        let response = WorkerResponse::success(
            "req-2",
            PredictionResult {
                class,
                confidence: probs.get(class),
                probabilities: probs,
                ntu_range: class.ntu_range(),
            },
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(value["id"], "req-2");
        assert_eq!(value["class"], "ultra cloudy");
        assert_eq!(value["ntu_range"]["min"], 3336.0);
        assert_eq!(value["probabilities"].as_object().unwrap().len(), CLASS_COUNT);
    }

    #[test]
    fn request_tolerates_missing_fields() {
        let req: InferenceRequest = serde_json::from_str(r#"{"image_base64":"abc"}"#).unwrap();
        assert_eq!(req.id, None);
        assert_eq!(req.image_base64, "abc");

        let req: InferenceRequest = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert_eq!(req.id.as_deref(), Some("x"));
        assert!(req.image_base64.is_empty());
    }
}
