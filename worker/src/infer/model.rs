use std::collections::HashSet;
use std::path::Path;

use log::{info, warn};
use tch::nn::{self, ModuleT};
use tch::vision::resnet;
use tch::{Device, Kind, TchError, Tensor};

use shared::CLASS_COUNT;

use crate::config::WorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Torch error: {0}")]
    Torch(#[from] TchError),
    #[error("Checkpoint does not match the model: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    KeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

/// ResNet-34 backbone with the classifier head replaced, plus the variable
/// store that owns its weights. Built once at startup and read-only after.
pub struct TurbidityModel {
    vs: nn::VarStore,
    net: nn::FuncT<'static>,
}

/// Classifier head on top of the 512-dim backbone features:
/// dropout -> linear(512) -> ReLU -> dropout -> linear(6).
///
/// The linears are registered as `fc.1` and `fc.4` so checkpoints trained
/// against the equivalent torchvision `nn.Sequential` head load by name.
fn classifier(root: &nn::Path) -> nn::FuncT<'static> {
    let backbone = resnet::resnet34_no_final_layer(root);
    let head = root / "fc";
    let fc1 = nn::linear(&head / "1", 512, 512, Default::default());
    let fc2 = nn::linear(&head / "4", 512, CLASS_COUNT as i64, Default::default());
    nn::func_t(move |xs, train| {
        backbone
            .forward_t(xs, train)
            .dropout(0.5, train)
            .apply(&fc1)
            .relu()
            .dropout(0.5, train)
            .apply(&fc2)
    })
}

/// Canonicalize checkpoint keys: unwrap a flattened `state_dict.` envelope,
/// strip the `module.` prefix left by DistributedDataParallel training, and
/// drop batch-norm step counters that have no counterpart in the rebuilt
/// graph.
fn canonicalize_keys(state: &mut Vec<(String, Tensor)>) {
    if !state.is_empty() && state.iter().all(|(name, _)| name.starts_with("state_dict.")) {
        for (name, _) in state.iter_mut() {
            *name = name["state_dict.".len()..].to_string();
        }
    }
    if state.iter().any(|(name, _)| name.starts_with("module.")) {
        for (name, _) in state.iter_mut() {
            if let Some(stripped) = name.strip_prefix("module.") {
                *name = stripped.to_string();
            }
        }
    }
    state.retain(|(name, _)| !name.ends_with("num_batches_tracked"));
}

impl TurbidityModel {
    /// Build the network on the given device with fresh weights, optionally
    /// seeding the backbone from an exported ImageNet checkpoint. Seeding
    /// failures fall back to the fresh initialization; the architecture is
    /// identical either way.
    pub fn build(device: Device, backbone_weights: Option<&Path>) -> Result<Self, ModelError> {
        let mut vs = nn::VarStore::new(device);
        let net = classifier(&vs.root());

        if let Some(path) = backbone_weights {
            match vs.load_partial(path) {
                Ok(missing) => info!(
                    "Seeded backbone from {} ({} variables kept at fresh init)",
                    path.display(),
                    missing.len()
                ),
                Err(e) => warn!(
                    "Could not seed backbone from {}: {}; keeping fresh initialization",
                    path.display(),
                    e
                ),
            }
        }

        Ok(Self { vs, net })
    }

    /// Load the trained checkpoint named by the config. A missing file is not
    /// an error: `Ok(None)` lets the process start in degraded mode. A file
    /// that is present but does not match the model exactly is fatal.
    pub fn load(config: &WorkerConfig, device: Device) -> Result<Option<Self>, ModelError> {
        if !config.model_path.exists() {
            return Ok(None);
        }

        let mut model = Self::build(device, config.backbone_weights.as_deref())?;
        let mut state = Tensor::load_multi_with_device(&config.model_path, device)?;
        canonicalize_keys(&mut state);
        model.apply_state_dict(state)?;
        model.vs.freeze();
        Ok(Some(model))
    }

    /// Strict state-dict copy: the checkpoint's key set must exactly equal
    /// the model's variables. Nothing is copied when any key is missing or
    /// unexpected; shape mismatches fail the copy itself.
    fn apply_state_dict(&mut self, state: Vec<(String, Tensor)>) -> Result<(), ModelError> {
        let mut variables = self.vs.variables();

        let mut unexpected: Vec<String> = state
            .iter()
            .filter(|(name, _)| !variables.contains_key(name))
            .map(|(name, _)| name.clone())
            .collect();
        let provided: HashSet<&str> = state.iter().map(|(name, _)| name.as_str()).collect();
        let mut missing: Vec<String> = variables
            .keys()
            .filter(|name| !provided.contains(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort();
            unexpected.sort();
            return Err(ModelError::KeyMismatch { missing, unexpected });
        }

        tch::no_grad(|| -> Result<(), TchError> {
            for (name, value) in &state {
                if let Some(variable) = variables.get_mut(name) {
                    variable.f_copy_(value)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// One forward pass in eval mode with no gradient tracking, softmax over
    /// the logits. Expects a `[1, 3, 224, 224]` batch.
    pub fn infer(&self, input: &Tensor) -> Result<Vec<f32>, TchError> {
        let input = input.to_device(self.vs.device());
        let logits = tch::no_grad(|| self.net.forward_t(&input, false));
        let probabilities = logits
            .softmax(-1, Kind::Float)
            .view([-1])
            .to_device(Device::Cpu);
        let count = probabilities.size()[0] as usize;
        let mut output = vec![0.0f32; count];
        probabilities.f_copy_data(&mut output, count)?;
        Ok(output)
    }
}
