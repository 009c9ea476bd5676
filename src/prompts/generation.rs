//! Generation metadata attached to saved media

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key of the positive prompt
pub const POSITIVE_PROMPT_KEY: &str = "Positive prompt";

/// Metadata key of the negative prompt
pub const NEGATIVE_PROMPT_KEY: &str = "Negative prompt";

/// Metadata key of the A1111 parameter string
pub const PARAMETERS_KEY: &str = "parameters";

/// Store `value` under `key`, trimmed
pub fn add_or_set_metadata_key(metadata: &mut Map<String, Value>, key: &str, value: &str) {
    metadata.insert(key.to_string(), Value::String(value.trim().to_string()));
}

/// Remove `key`, true when it was present
pub fn remove_metadata_key(metadata: &mut Map<String, Value>, key: &str) -> bool {
    metadata.remove(key).is_some()
}

pub fn set_positive_prompt(metadata: &mut Map<String, Value>, prompt: &str) {
    add_or_set_metadata_key(metadata, POSITIVE_PROMPT_KEY, prompt);
}

pub fn set_negative_prompt(metadata: &mut Map<String, Value>, prompt: &str) {
    add_or_set_metadata_key(metadata, NEGATIVE_PROMPT_KEY, prompt);
}

/// Generation settings rendered in the A1111 `parameters` format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct A1111Parameters {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub model_name: String,
    pub sampler_name: String,
    pub scheduler_name: String,
    pub vae_name: String,
    /// Negative layer index, rendered as its absolute value
    pub clip_skip: i32,
    /// 0 = use the image width
    pub width: u32,
    /// 0 = use the image height
    pub height: u32,
}

impl Default for A1111Parameters {
    fn default() -> Self {
        Self {
            positive_prompt: String::new(),
            negative_prompt: String::new(),
            seed: 0,
            steps: 20,
            cfg: 8.0,
            model_name: String::new(),
            sampler_name: String::new(),
            scheduler_name: String::new(),
            vae_name: String::new(),
            clip_skip: -1,
            width: 0,
            height: 0,
        }
    }
}

/// Render the A1111 parameter string
///
/// `image_size` fills in width and height when they are 0. Zero or empty
/// settings are left out; the scheduler is appended to the sampler unless
/// it is `normal`.
pub fn build_a1111_parameters(params: &A1111Parameters, image_size: (u32, u32)) -> String {
    let mut out = format!("{}\n", params.positive_prompt.trim());

    if !params.negative_prompt.is_empty() {
        out.push_str(&format!("Negative prompt: {}\n", params.negative_prompt.trim()));
    }
    if params.steps > 0 {
        out.push_str(&format!("Steps: {}, ", params.steps));
    }
    if !params.sampler_name.is_empty() {
        let scheduler = if params.scheduler_name != "normal" {
            format!(" {}", params.scheduler_name)
        } else {
            String::new()
        };
        out.push_str(&format!("Sampler: {}{}, ", params.sampler_name, scheduler));
    }
    if params.cfg != 0.0 {
        out.push_str(&format!("CFG Scale: {:?}, ", params.cfg));
    }
    if params.seed > 0 {
        out.push_str(&format!("Seed: {}, ", params.seed));
    }

    let width = if params.width > 0 { params.width } else { image_size.0 };
    let height = if params.height > 0 { params.height } else { image_size.1 };
    out.push_str(&format!("Size: {}x{}, ", width, height));

    if !params.model_name.is_empty() {
        out.push_str(&format!("Model: {}, ", params.model_name));
    }
    if !params.vae_name.is_empty() {
        out.push_str(&format!("VAE: {}, ", params.vae_name));
    }
    if params.clip_skip != 0 {
        out.push_str(&format!("Clip skip: {}, ", -params.clip_skip));
    }

    let trimmed = out.trim();
    trimmed.strip_suffix(',').unwrap_or(trimmed).to_string()
}

/// Store the A1111 parameter string under `parameters`
pub fn set_a1111_metadata(
    metadata: &mut Map<String, Value>,
    params: &A1111Parameters,
    image_size: (u32, u32),
) {
    let parameters = build_a1111_parameters(params, image_size);
    if !parameters.trim().is_empty() {
        add_or_set_metadata_key(metadata, PARAMETERS_KEY, &parameters);
    }
}
