//! Builders for generation requests
use crate::config::GenerationParams;
use crate::proto;
use rand::Rng;
use uuid::Uuid;

/// Random 32-bit seed in `0..u32::MAX`, fresh per call
pub fn random_seed() -> u32 {
    rand::thread_rng().gen_range(0..u32::MAX)
}

/// Fresh request id (UUID v4)
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build a text-to-image request with a single text prompt.
///
/// The request asks for image artifacts, uses the K-LMS diffusion sampler and
/// carries one step parameter with the cfg-scale from `params`.
pub fn image_request(
    engine: &str,
    text: &str,
    width: u64,
    height: u64,
    seed: u32,
    params: &GenerationParams,
) -> proto::Request {
    let image = proto::ImageParameters {
        width: Some(width),
        height: Some(height),
        seed: vec![seed],
        steps: Some(params.steps),
        samples: Some(params.samples),
        transform: Some(proto::TransformType {
            r#type: Some(proto::transform_type::Type::Diffusion(
                proto::DiffusionSampler::SamplerKLms as i32,
            )),
        }),
        parameters: vec![proto::StepParameter {
            scaled_step: 0.0,
            sampler: Some(proto::SamplerParameters {
                cfg_scale: Some(params.cfg_scale),
                ..Default::default()
            }),
        }],
    };

    proto::Request {
        engine_id: engine.to_string(),
        request_id: new_request_id(),
        requested_type: proto::ArtifactType::ArtifactImage as i32,
        prompt: vec![proto::Prompt {
            parameters: None,
            prompt: Some(proto::prompt::Prompt::Text(text.to_string())),
        }],
        params: Some(proto::request::Params::Image(image)),
    }
}
