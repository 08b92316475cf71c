use super::Mask;
use crate::segmentation::ModelOutput;
use anyhow::{Context, Result};

/// Convert raw model output into a person mask at model resolution
///
/// Category ids: anything but background (0) becomes 255. Confidence planes:
/// the per-pixel maximum over all non-background planes, raised to `gamma`
/// and scaled to 0-255. A gamma above 1 pulls mid confidences down and
/// sharpens the perceived edge.
pub fn convert(output: &ModelOutput, gamma: f32) -> Result<Mask> {
    let _span = tracing::debug_span!("convert_mask").entered();
    output.validate()?;

    let (width, height) = output.dimensions();
    let data: Vec<u8> = match output {
        ModelOutput::Categories { ids, .. } => ids
            .iter()
            .map(|&id| if id != 0 { 255 } else { 0 })
            .collect(),
        ModelOutput::Confidences {
            channels,
            background,
            ..
        } => {
            let person: Vec<&Vec<f32>> = channels
                .iter()
                .enumerate()
                .filter(|(index, _)| Some(*index) != *background)
                .map(|(_, plane)| plane)
                .collect();
            let apply_gamma = (gamma - 1.0).abs() > f32::EPSILON;

            (0..width as usize * height as usize)
                .map(|i| {
                    let confidence = person
                        .iter()
                        .map(|plane| plane[i])
                        .fold(0.0f32, f32::max)
                        .clamp(0.0, 1.0);
                    let confidence = if apply_gamma {
                        confidence.powf(gamma)
                    } else {
                        confidence
                    };
                    (confidence * 255.0).round() as u8
                })
                .collect()
        }
    };

    Mask::from_raw(width, height, data).context("mask buffer does not match model output dimensions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_map_to_full_foreground() {
        let output = ModelOutput::Categories {
            width: 4,
            height: 1,
            ids: vec![0, 1, 3, 0],
        };
        let mask = convert(&output, 1.2).unwrap();
        assert_eq!(mask.as_raw(), &vec![0, 255, 255, 0]);
    }

    #[test]
    fn test_confidences_take_max_of_person_planes() {
        let output = ModelOutput::Confidences {
            width: 3,
            height: 1,
            channels: vec![
                vec![1.0, 1.0, 1.0], // background, ignored
                vec![0.2, 0.0, 1.0],
                vec![0.4, 0.6, 0.0],
            ],
            background: Some(0),
        };
        let mask = convert(&output, 1.0).unwrap();
        assert_eq!(mask.as_raw(), &vec![102, 153, 255]);
    }

    #[test]
    fn test_gamma_darkens_mid_confidence_only() {
        let output = ModelOutput::Confidences {
            width: 3,
            height: 1,
            channels: vec![vec![0.0, 0.5, 1.0]],
            background: None,
        };
        let mask = convert(&output, 1.2).unwrap();
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert!(mask.get_pixel(1, 0)[0] < 128);
        assert_eq!(mask.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn test_out_of_range_confidence_is_clamped() {
        let output = ModelOutput::Confidences {
            width: 2,
            height: 1,
            channels: vec![vec![-0.5, 1.7]],
            background: None,
        };
        let mask = convert(&output, 1.0).unwrap();
        assert_eq!(mask.as_raw(), &vec![0, 255]);
    }

    #[test]
    fn test_malformed_output_is_rejected() {
        let output = ModelOutput::Categories {
            width: 2,
            height: 2,
            ids: vec![1],
        };
        assert!(convert(&output, 1.0).is_err());
    }
}
