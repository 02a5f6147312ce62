//! Compact reference network for each registered variant.
//!
//! Full-size backbones live outside this crate. These fully-convolutional
//! stand-ins keep the parameter naming, head layout and output contract of
//! the variants so the training core can be exercised end to end.

use super::{ModelMode, ModelOutput, ParamStore, SegmentationModel};
use crate::context::RunContext;
use crate::error::{Result, TrainError};
use candle_core::{Device, Tensor, Var};
use rand::Rng;
use rand::rngs::StdRng;
use wscd_core::{Backbone, ModelVariant, Refinement};

struct Conv {
    weight: Tensor,
    bias: Tensor,
    padding: usize,
}

impl Conv {
    fn new(
        store: &mut ParamStore,
        rng: &mut StdRng,
        device: &Device,
        name: &str,
        (c_in, c_out, kernel): (usize, usize, usize),
    ) -> Result<Self> {
        let fan_in = (c_in * kernel * kernel) as f32;
        let bound = (6.0 / fan_in).sqrt();
        let weights: Vec<f32> = (0..c_out * c_in * kernel * kernel)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let bias_bound = 1.0 / fan_in.sqrt();
        let biases: Vec<f32> = (0..c_out)
            .map(|_| rng.gen_range(-bias_bound..bias_bound))
            .collect();

        let weight = Var::from_vec(weights, (c_out, c_in, kernel, kernel), device)?;
        let bias = Var::from_vec(biases, c_out, device)?;
        let conv = Self {
            weight: weight.as_tensor().clone(),
            bias: bias.as_tensor().clone(),
            padding: kernel / 2,
        };
        store.insert(format!("{name}.weight"), weight)?;
        store.insert(format!("{name}.bias"), bias)?;
        Ok(conv)
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out_channels = self.bias.dims1()?;
        let ys = xs.conv2d(&self.weight, self.padding, 1, 1, 1)?;
        Ok(ys.broadcast_add(&self.bias.reshape((1, out_channels, 1, 1))?)?)
    }
}

struct Block {
    conv: Conv,
    residual: bool,
}

/// Pseudo-label hybrid attention network with boundary refinement, reduced form.
pub struct PhaNet {
    variant: ModelVariant,
    in_channels: usize,
    stem: Conv,
    blocks: Vec<Block>,
    boundary_hidden: Conv,
    boundary_out: Conv,
    mask_head: Conv,
    params: ParamStore,
    mode: ModelMode,
}

fn widths(backbone: Backbone) -> &'static [usize] {
    match backbone {
        Backbone::ResNet34 => &[8, 8, 8],
        Backbone::ResNet50 => &[16, 16, 16],
        Backbone::Vgg16 => &[8, 16, 16],
    }
}

impl PhaNet {
    pub fn new(variant: ModelVariant, in_channels: usize, ctx: &RunContext) -> Result<Self> {
        if in_channels == 0 {
            return Err(TrainError::model("input channel count must be positive"));
        }
        let device = ctx.device();
        let mut rng = ctx.rng("model-init");
        let mut params = ParamStore::new();
        let backbone = variant.backbone();
        let widths = widths(backbone);

        let stem = Conv::new(
            &mut params,
            &mut rng,
            device,
            "backbone.stem",
            (in_channels, widths[0], 3),
        )?;
        let mut blocks = Vec::with_capacity(widths.len() - 1);
        for (idx, pair) in widths.windows(2).enumerate() {
            let conv = Conv::new(
                &mut params,
                &mut rng,
                device,
                &format!("backbone.block{}", idx + 1),
                (pair[0], pair[1], 3),
            )?;
            blocks.push(Block {
                conv,
                residual: backbone != Backbone::Vgg16 && pair[0] == pair[1],
            });
        }

        let width = widths[widths.len() - 1];
        let boundary_hidden = Conv::new(
            &mut params,
            &mut rng,
            device,
            "brm.hidden",
            (width, width, 3),
        )?;
        let boundary_out = Conv::new(&mut params, &mut rng, device, "brm.out", (width, 2, 1))?;
        let mask_head = match variant.refinement() {
            Refinement::Dual => {
                Conv::new(&mut params, &mut rng, device, "dbrm.fuse", (2 * width, 1, 1))?
            }
            Refinement::Single => {
                Conv::new(&mut params, &mut rng, device, "pha.out", (width, 1, 1))?
            }
        };

        Ok(Self {
            variant,
            in_channels,
            stem,
            blocks,
            boundary_hidden,
            boundary_out,
            mask_head,
            params,
            mode: ModelMode::Train,
        })
    }
}

impl SegmentationModel for PhaNet {
    fn variant(&self) -> ModelVariant {
        self.variant
    }

    fn forward(&self, images: &Tensor) -> Result<ModelOutput> {
        let (_, channels, _, _) = images.dims4().map_err(|_| {
            TrainError::contract(format!(
                "expected images shaped (B, C, H, W), got {:?}",
                images.dims()
            ))
        })?;
        if channels != self.in_channels {
            return Err(TrainError::contract(format!(
                "model expects {} input channels, got {channels}",
                self.in_channels
            )));
        }

        let mut features = self.stem.forward(images)?.relu()?;
        for block in &self.blocks {
            let next = block.conv.forward(&features)?.relu()?;
            features = if block.residual {
                (next + &features)?
            } else {
                next
            };
        }

        let hidden = self.boundary_hidden.forward(&features)?.relu()?;
        let boundary = self.boundary_out.forward(&hidden)?;
        let logits = match self.variant.refinement() {
            Refinement::Dual => {
                let fused = Tensor::cat(&[&features, &hidden], 1)?;
                self.mask_head.forward(&fused)?
            }
            Refinement::Single => self.mask_head.forward(&features)?,
        };
        // sigmoid: 1 / (1 + e^-x)
        let primary = logits.neg()?.exp()?.affine(1.0, 1.0)?.recip()?;
        Ok(ModelOutput { primary, boundary })
    }

    fn parameters(&self) -> &ParamStore {
        &self.params
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(batch: usize, channels: usize) -> Tensor {
        Tensor::ones((batch, channels, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let ctx = RunContext::cpu(1);
        for variant in ModelVariant::ALL {
            let model = PhaNet::new(variant, 4, &ctx).unwrap();
            let out = model.forward(&images(2, 4)).unwrap();
            assert_eq!(out.primary.dims(), &[2, 1, 4, 4], "{variant}");
            assert_eq!(out.boundary.dims(), &[2, 2, 4, 4], "{variant}");
        }
    }

    #[test]
    fn test_primary_is_probability() {
        let model = PhaNet::new(ModelVariant::ResNet34Dbrm, 4, &RunContext::cpu(1)).unwrap();
        let out = model.forward(&images(1, 4)).unwrap();
        let values = out.primary.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_channel_mismatch_is_contract_violation() {
        let model = PhaNet::new(ModelVariant::Vgg16Brm, 4, &RunContext::cpu(1)).unwrap();
        assert!(matches!(
            model.forward(&images(1, 3)),
            Err(TrainError::Contract(_))
        ));
    }

    #[test]
    fn test_init_is_seeded() {
        let a = PhaNet::new(ModelVariant::ResNet50Brm, 4, &RunContext::cpu(9)).unwrap();
        let b = PhaNet::new(ModelVariant::ResNet50Brm, 4, &RunContext::cpu(9)).unwrap();
        assert_eq!(
            a.parameters().state_dict().unwrap(),
            b.parameters().state_dict().unwrap()
        );
    }

    #[test]
    fn test_refinement_changes_head_names() {
        let ctx = RunContext::cpu(1);
        let dual = PhaNet::new(ModelVariant::ResNet34Dbrm, 4, &ctx).unwrap();
        let single = PhaNet::new(ModelVariant::ResNet34Brm, 4, &ctx).unwrap();
        assert!(dual.parameters().contains("dbrm.fuse.weight"));
        assert!(!single.parameters().contains("dbrm.fuse.weight"));
        assert!(single.parameters().contains("pha.out.weight"));
        assert!(single.parameters().contains("backbone.stem.weight"));
    }
}
