use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use image::RgbImage;
use sightline::{
    config::PipelineConfig,
    detection::DetectorConfig,
    nn::{FnInferer, Inferer, Outputs, Tensor},
    pipeline::{FrameOutcome, Models, Pipeline},
    transport::{topics, Bus, Publisher},
};

type Script = Arc<Mutex<Option<[f32; 4]>>>;

/// A face detector reporting whatever box is currently in `script`.
fn scripted_detector(script: Script) -> Box<dyn Inferer> {
    let config = DetectorConfig::face();
    Box::new(FnInferer(move |_: &Tensor| -> anyhow::Result<Outputs> {
        let mut boxes = vec![0.0; config.num_boxes * config.num_coords];
        let mut scores = vec![-100.0; config.num_boxes];
        if let Some([x, y, w, h]) = *script.lock().unwrap() {
            let anchor = 0.5 / 16.0;
            let res = config.input_width as f32;
            boxes[0] = (x + w / 2.0 - anchor) * res;
            boxes[1] = (y + h / 2.0 - anchor) * res;
            boxes[2] = w * res;
            boxes[3] = h * res;
            scores[0] = 100.0;
        }
        Ok(Outputs::from(vec![
            Tensor::from_shape_vec(vec![1, config.num_boxes, config.num_coords], boxes)?,
            Tensor::from_shape_vec(vec![1, config.num_boxes, 1], scores)?,
        ]))
    }))
}

fn face_mesh() -> Box<dyn Inferer> {
    Box::new(FnInferer(|_: &Tensor| -> anyhow::Result<Outputs> {
        let surface = (0..468)
            .flat_map(|i| [(i % 192) as f32, (i / 3) as f32 % 192.0, 0.0])
            .collect::<Vec<_>>();
        Ok(Outputs::from(vec![
            Tensor::from_shape_vec(vec![1, 468 * 3], surface)?,
            Tensor::from_shape_vec(vec![1, 1], vec![5.0])?,
        ]))
    }))
}

fn face_pipeline(bus: &Bus, script: &Script) -> Pipeline {
    Pipeline::face(
        &PipelineConfig::default(),
        Models {
            detector: scripted_detector(script.clone()),
            landmarks: face_mesh(),
            iris: None,
        },
        Publisher::new(bus.clone(), Default::default()),
    )
    .unwrap()
}

fn tracked_x(outcome: FrameOutcome) -> f32 {
    match outcome {
        FrameOutcome::Tracked(tracked) => tracked.detection.rect().x(),
        FrameOutcome::Reset => panic!("expected a tracked face"),
    }
}

#[test]
fn box_is_smoothed_while_tracking() {
    let bus = Bus::new();
    let script = Script::default();
    let mut pipeline = face_pipeline(&bus, &script);
    let frame = RgbImage::new(128, 128);

    *script.lock().unwrap() = Some([0.3, 0.3, 0.4, 0.4]);
    assert_abs_diff_eq!(tracked_x(pipeline.process(&frame).unwrap()), 0.3, epsilon = 1e-5);

    *script.lock().unwrap() = Some([0.1, 0.1, 0.3, 0.3]);
    let x = tracked_x(pipeline.process(&frame).unwrap());
    assert!(x > 0.1 + 1e-3 && x < 0.3, "{x}");
}

#[test]
fn lost_subject_resets_filters() {
    let bus = Bus::new();
    let sub = bus.subscribe([topics::FACE_RESET]);
    let script = Script::default();
    let mut pipeline = face_pipeline(&bus, &script);
    let frame = RgbImage::new(128, 128);

    *script.lock().unwrap() = Some([0.3, 0.3, 0.4, 0.4]);
    tracked_x(pipeline.process(&frame).unwrap());
    assert!(sub.try_recv().is_none());

    *script.lock().unwrap() = None;
    assert_eq!(pipeline.process(&frame).unwrap(), FrameOutcome::Reset);
    let msg = sub.try_recv().unwrap();
    assert_eq!(msg.topic(), topics::FACE_RESET);
    assert!(msg.is_reset());

    // Reacquired subject starts from a fresh filter state.
    *script.lock().unwrap() = Some([0.1, 0.1, 0.3, 0.3]);
    assert_abs_diff_eq!(tracked_x(pipeline.process(&frame).unwrap()), 0.1, epsilon = 1e-5);
}

#[test]
fn subscribers_only_see_their_topics() {
    let bus = Bus::new();
    let boxes = bus.subscribe([topics::FACE_BOX]);
    let palms = bus.subscribe([topics::PALM_BOX, topics::PALM_RESET]);
    let script = Script::default();
    let mut pipeline = face_pipeline(&bus, &script);

    *script.lock().unwrap() = Some([0.25, 0.25, 0.5, 0.5]);
    pipeline.process(&RgbImage::new(128, 128)).unwrap();

    let msg = boxes.try_recv().unwrap();
    assert_eq!(msg.topic(), topics::FACE_BOX);
    assert!(palms.try_recv().is_none());
}
