use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Trained checkpoint. A missing file is non-fatal: the worker starts in
    /// degraded mode and answers every request with an error.
    pub model_path: PathBuf,
    /// Optional ImageNet ResNet-34 export used to seed the backbone before
    /// the checkpoint is applied.
    pub backbone_weights: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let model_path = env::var("MODEL_PATH").unwrap_or_else(|_| "best.pth".to_string());
        let backbone_weights = env::var("BACKBONE_WEIGHTS").ok().map(PathBuf::from);
        Self {
            model_path: PathBuf::from(model_path),
            backbone_weights,
        }
    }
}
