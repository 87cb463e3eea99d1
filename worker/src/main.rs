mod config;
mod infer;
mod protocol;

use std::io;

use tch::Device;

use config::WorkerConfig;
use infer::engine::InferenceEngine;
use infer::model::TurbidityModel;
use protocol::{Worker, device_name};

fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    let config = WorkerConfig::from_env();
    let device = Device::cuda_if_available();
    log::info!("Loading model from: {}", config.model_path.display());

    let model = match TurbidityModel::load(&config, device) {
        Ok(Some(model)) => {
            log::info!("Model loaded on {}", device_name(device));
            Some(model)
        }
        Ok(None) => {
            log::warn!("Model file not found at '{}'", config.model_path.display());
            None
        }
        Err(e) => {
            log::error!("Failed to load model: {}", e);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Model loading failed: {}", e),
            ));
        }
    };

    let worker = Worker::new(model.map(InferenceEngine::new), device);
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    worker.serve(stdin.lock(), &mut stdout)
}
