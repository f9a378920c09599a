//! End-to-end tests of the FCN builders.
//!
//! Full-size models are mostly only built: parameters are allocated on
//! first use, so shape checks stay cheap. Training runs on a reduced VGG
//! with the same block structure; the full-size training run is ignored
//! by default (`cargo test -- --ignored`).

use fcn::encoders::VggArchitecture;
use fcn::models::fcn_vgg;
use fcn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn options(format: DataFormat) -> FcnOptions {
    FcnOptions {
        config: Some(BackendConfig::default().with_data_format(format)),
        seed: Some(42),
        ..FcnOptions::default()
    }
}

/// Reorders a channels-last shape for `format`.
fn in_format(shape: [usize; 3], format: DataFormat) -> Vec<usize> {
    match format {
        DataFormat::ChannelsLast => shape.to_vec(),
        DataFormat::ChannelsFirst => vec![shape[2], shape[0], shape[1]],
    }
}

fn check_vgg16_shapes(format: DataFormat) {
    let model = fcn_vgg16(&in_format([500, 500, 3], format), 21, options(format)).expect("fcn_vgg16");

    let names = model.layer_names();
    for upscore in ["upscore_feat1", "upscore_feat2", "upscore_feat3"] {
        assert!(names.contains(&upscore), "missing {upscore}");
    }

    let expected = [
        ("block1_pool", [250, 250, 64]),
        ("block2_pool", [125, 125, 128]),
        ("block3_pool", [63, 63, 256]),
        ("block4_pool", [32, 32, 512]),
        ("block5_pool", [16, 16, 512]),
        ("dropout_2", [16, 16, 4096]),
        ("upscore_feat1", [32, 32, 21]),
        ("upscore_feat2", [63, 63, 21]),
        ("upscore_feat3", [500, 500, 21]),
        ("score", [500, 500, 21]),
    ];
    for (name, shape) in expected {
        assert_eq!(
            model.layer_output_shape(name).expect(name),
            in_format(shape, format).as_slice(),
            "{name}"
        );
    }
    assert_eq!(model.output_shape(), in_format([500, 500, 21], format).as_slice());
}

#[test]
fn test_fcn_vgg16_shape() {
    check_vgg16_shapes(DataFormat::ChannelsLast);
}

#[test]
fn test_fcn_vgg16_shape_channels_first() {
    check_vgg16_shapes(DataFormat::ChannelsFirst);
}

#[test]
fn test_fcn_vgg16_non_square_input() {
    let model = fcn_vgg16(&[1366, 768, 3], 21, options(DataFormat::ChannelsLast)).expect("fcn_vgg16");
    assert_eq!(model.output_shape(), &[1366, 768, 21]);
    assert_eq!(model.layer_output_shape("block5_pool").expect("pool5"), &[43, 24, 512]);
}

#[test]
fn test_fcn_vgg16_parameter_count() {
    let model = fcn_vgg16(&[500, 500, 3], 21, options(DataFormat::ChannelsLast)).expect("fcn_vgg16");
    let encoder_convs = 14_714_688;
    let fc = 7 * 7 * 512 * 4096 + 4096 + 4096 * 4096 + 4096;
    let scores = (4096 + 512 + 256) * 21 + 3 * 21;
    assert_eq!(model.count_params(), encoder_convs + fc + scores);
}

#[test]
fn test_fcn_vgg19_shape() {
    let model = fcn_vgg19(&[224, 224, 3], 5, options(DataFormat::ChannelsLast)).expect("fcn_vgg19");
    assert_eq!(model.output_shape(), &[224, 224, 5]);
    assert_eq!(model.layer_output_shape("block5_conv4").expect("conv"), &[14, 14, 512]);
}

#[test]
fn test_unknown_weights_build_without_loading() {
    let mut opts = options(DataFormat::ChannelsLast);
    opts.weights = Some("not-imagenet".to_string());
    opts.trainable_encoder = false;
    let model = fcn_vgg16(&[64, 64, 3], 3, opts).expect("fcn_vgg16");
    // Nothing was loaded, so nothing was frozen
    assert!(model.is_trainable("block1_conv1").expect("conv"));
}

const SMALL_VGG: VggArchitecture<'static> = VggArchitecture {
    name: "small_vgg",
    filters: &[4, 8, 8],
    convs: &[1, 2, 2],
    fc_filters: 16,
    pretrained_url: None,
};

fn random_batch(format: DataFormat, (h, w): (usize, usize), classes: usize) -> (Tensor, Tensor) {
    let mut rng = StdRng::seed_from_u64(7);
    let x: Vec<f32> = (0..h * w * 3).map(|_| rng.gen::<f32>()).collect();
    let labels: Vec<usize> = (0..h * w).map(|_| rng.gen_range(0..classes)).collect();

    let mut y = vec![0.0; h * w * classes];
    for (pixel, &label) in labels.iter().enumerate() {
        let at = match format {
            DataFormat::ChannelsLast => pixel * classes + label,
            DataFormat::ChannelsFirst => label * h * w + pixel,
        };
        y[at] = 1.0;
    }
    let x = match format {
        DataFormat::ChannelsLast => Tensor::from_vec(x, &[1, h, w, 3]),
        DataFormat::ChannelsFirst => Tensor::from_vec(x, &[1, 3, h, w]),
    };
    let y_shape = [1].into_iter().chain(in_format([h, w, classes], format)).collect::<Vec<_>>();
    (x, Tensor::from_vec(y, &y_shape))
}

fn check_training_step(format: DataFormat) {
    let classes = 5;
    let mut model = fcn_vgg(&SMALL_VGG, &in_format([16, 16, 3], format), classes, options(format)).expect("fcn");
    assert_eq!(model.output_shape(), in_format([16, 16, classes], format).as_slice());

    let (x, y) = random_batch(format, (16, 16), classes);
    model.compile(RMSprop::new(1e-3));
    let history = model.fit(&x, &y, 1, 1).expect("fit");
    assert!(history.loss[0].is_finite());

    let (loss, accuracy) = model.evaluate(&x, &y).expect("evaluate");
    assert!(loss.is_finite());
    assert!((0.0..=1.0).contains(&accuracy));

    let pred = model.predict(&x).expect("predict");
    assert!(pred.data().iter().all(|v| v.is_finite()));
}

#[test]
fn test_fcn_training_step_is_finite() {
    check_training_step(DataFormat::ChannelsLast);
}

#[test]
fn test_fcn_training_step_is_finite_channels_first() {
    check_training_step(DataFormat::ChannelsFirst);
}

#[test]
#[ignore = "trains full-size VGG16 on a 500x500 image, minutes on a CPU"]
fn test_fcn_vgg16_correctness() {
    let classes = 21;
    let format = DataFormat::ChannelsLast;
    let mut model = fcn_vgg16(&[500, 500, 3], classes, options(format)).expect("fcn_vgg16");

    let (x, y) = random_batch(format, (500, 500), classes);
    model.compile(RMSprop::new(1e-3));
    let history = model.fit(&x, &y, 1, 1).expect("fit");
    assert!(history.loss[0].is_finite());

    let (loss, _) = model.evaluate(&x, &y).expect("evaluate");
    assert!(loss.is_finite());

    let pred = model.predict(&x).expect("predict");
    assert_eq!(pred.shape(), &[1, 500, 500, classes]);
    assert!(pred.data().iter().all(|v| v.is_finite()));
}
