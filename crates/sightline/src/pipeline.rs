//! Per-frame orchestration of detection, cropping, landmark estimation and publishing.
//!
//! Each frame runs through the same cycle:
//!
//! ```text
//! detect boxes ─┬─ no box ──────────────────────────────────────────────── publish reset
//!               └─ primary box ─ crop ─ landmarks ─┬─ subject absent ───── publish reset
//!                                                  └─ restore, filter ─── publish results
//! ```
//!
//! Faces additionally get a head pose, a mouth aspect ratio and (with an iris network) eye
//! landmarks and gaze. Hands get a gesture.
//!
//! A reset clears every velocity filter owned by the pipeline, so that a re-acquired subject is not
//! smeared toward its last known position. Frames whose inference fails are dropped without
//! touching any filter.

use std::{io, sync::Arc};

use image::RgbImage;
use pawawwewism::{promise, Promise, PromiseHandle, Worker};
use serde::{Deserialize, Serialize};

use crate::analysis::{
    classify_hand_gesture, eye_aspect_ratio, mouth_aspect_ratio, Gaze, GazeEstimator, HandGesture,
};
use crate::config::{IrisConfig, PipelineConfig, StageConfig};
use crate::detection::nms::NonMaxSuppression;
use crate::detection::{BoxDecoder, Detection, DetectorConfig};
use crate::filter::{Filter, FilterParams, RectFilter};
use crate::geometry::Rect;
use crate::landmark::{mesh, LandmarkConfig, LandmarkStage, Landmarks};
use crate::nn::{ColorMapper, ImageEncoder, Inferer, InputShape, Letterbox};
use crate::pose::{HeadPose, HeadPoseEstimator};
use crate::roi::RoiTransformer;
use crate::timer::{FpsCounter, Timer};
use crate::transport::{topics, Publisher};
use crate::{Error, Result};

/// Result of running a box detector on one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The highest-scoring detection that survived non-maximum suppression, in normalized frame
    /// coordinates.
    Detected(Detection),
    /// Nothing was detected. Dependent stages should clear their state.
    Reset,
}

/// Runs an SSD box detector on whole frames and picks the primary detection.
pub struct BoxStage {
    decoder: BoxDecoder,
    nms: NonMaxSuppression,
    encoder: ImageEncoder,
    inferer: Box<dyn Inferer>,
    filter: Option<RectFilter>,
    detections: Vec<Detection>,
    t_infer: Timer,
    t_decode: Timer,
}

impl BoxStage {
    pub fn new<I: Inferer + 'static>(
        config: DetectorConfig,
        box_filter: Option<FilterParams>,
        inferer: I,
    ) -> Result<Self> {
        config.validate()?;
        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(config.nms_iou_threshold);
        let encoder = ImageEncoder::new(
            config.input_width,
            config.input_height,
            InputShape::Nhwc,
            ColorMapper::linear(-1.0..=1.0),
        );
        Ok(Self {
            decoder: BoxDecoder::new(config)?,
            nms,
            encoder,
            inferer: Box::new(inferer),
            filter: box_filter.map(RectFilter::new),
            detections: Vec::new(),
            t_infer: Timer::new("box inference"),
            t_decode: Timer::new("box decoding"),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        self.decoder.config()
    }

    /// Detects the primary subject in `frame`.
    ///
    /// The frame is letterboxed into the network input, and the resulting detection is mapped back
    /// to normalized coordinates of the unpadded frame.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<StageOutcome> {
        let config = self.decoder.config();
        let letterbox = Letterbox::new(
            frame.width(),
            frame.height(),
            config.input_width,
            config.input_height,
        );
        let tensor = self.encoder.encode(&letterbox.apply(frame));
        let outputs = self
            .t_infer
            .time(|| self.inferer.invoke(&tensor))
            .map_err(Error::InferenceFailure)?;
        let raw_boxes = outputs.flat(0).map_err(Error::InferenceFailure)?;
        let raw_scores = outputs.flat(1).map_err(Error::InferenceFailure)?;

        let _guard = self.t_decode.start();
        self.decoder
            .decode_into(&raw_boxes, &raw_scores, &mut self.detections)?;
        log::trace!("{} raw detections", self.detections.len());
        let primary = self.nms.process(&mut self.detections).next();
        self.detections.clear();

        let Some(detection) = primary else {
            return Ok(StageOutcome::Reset);
        };
        let mut detection = detection.map(&letterbox.restore_transform());
        if let Some(filter) = &mut self.filter {
            detection.set_rect(filter.push(detection.rect()));
        }
        Ok(StageOutcome::Detected(detection))
    }

    pub fn reset_filters(&mut self) {
        if let Some(filter) = &mut self.filter {
            filter.reset();
        }
    }

    pub fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [&self.t_infer, &self.t_decode]
    }
}

/// Iris landmarks and derived measurements of both eyes.
#[derive(Debug, Clone, PartialEq)]
pub struct Eyes {
    pub left: Landmarks,
    pub right: Landmarks,
    pub aspect_ratios: [f32; 2],
    pub gaze: Gaze,
}

/// Runs the iris network on both eyes of a face mesh.
pub struct IrisStage {
    roi: RoiTransformer,
    left: LandmarkStage,
    right: LandmarkStage,
    gaze: GazeEstimator,
}

impl IrisStage {
    /// Creates an iris stage.
    ///
    /// Left eyes are processed with `config.landmarks` unchanged. Right eyes are mirrored relative
    /// to that, so a network trained on left eyes sees both eyes the same way.
    pub fn new(config: &IrisConfig, inferer: Arc<dyn Inferer>) -> Self {
        let left = config.landmarks.clone();
        let right = LandmarkConfig {
            flip_horizontal: !left.flip_horizontal,
            ..left.clone()
        };
        Self {
            roi: RoiTransformer::new(config.roi.clone()),
            left: LandmarkStage::new(left, inferer.clone()),
            right: LandmarkStage::new(right, inferer),
            gaze: GazeEstimator::new(),
        }
    }

    /// Estimates iris landmarks on `frame`, using the eye regions of `face` (a 468-point mesh in
    /// sensor pixels).
    ///
    /// Returns `Ok(None)` if an eye region cannot be cropped.
    pub fn estimate(&mut self, frame: &RgbImage, face: &Landmarks) -> Result<Option<Eyes>> {
        if face.len() != mesh::NUM_LANDMARKS {
            return Err(Error::mismatch("face landmarks", mesh::NUM_LANDMARKS, face.len()));
        }
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        let region = |indices: &[usize]| -> Option<Rect> {
            face.bounding_rect(indices)
                .map(|r| r.scale_axes(1.0 / w, 1.0 / h))
        };
        let (Some(left_rect), Some(right_rect)) = (
            region(&mesh::LEFT_EYE_REGION),
            region(&mesh::RIGHT_EYE_REGION),
        ) else {
            return Ok(None);
        };

        let crop = |rect: Rect| match self.roi.crop_rect(frame, rect, None) {
            Ok(roi) => Ok(Some(roi)),
            Err(Error::DegenerateGeometry(reason)) => {
                log::trace!("skipping eye: {reason}");
                Ok(None)
            }
            Err(e) => Err(e),
        };
        let (Some(left_roi), Some(right_roi)) = (crop(left_rect)?, crop(right_rect)?) else {
            return Ok(None);
        };

        let left = self.left.estimate(&left_roi)?;
        let right = self.right.estimate(&right_roi)?;
        let (Some(left), Some(right)) = (left, right) else {
            return Ok(None);
        };

        let aspect_ratios = [eye_aspect_ratio(&left)?, eye_aspect_ratio(&right)?];
        let gaze = self.gaze.estimate(&left, &right)?;
        Ok(Some(Eyes {
            left,
            right,
            aspect_ratios,
            gaze,
        }))
    }

    pub fn reset_filters(&mut self) {
        self.left.reset_filters();
        self.right.reset_filters();
        self.gaze.reset();
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        self.left.timers().into_iter().chain(self.right.timers())
    }
}

/// The kind of subject a [`Pipeline`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Face,
    Palm,
}

impl Subject {
    pub fn name(self) -> &'static str {
        match self {
            Subject::Face => "face",
            Subject::Palm => "palm",
        }
    }

    pub fn box_topic(self) -> &'static str {
        match self {
            Subject::Face => topics::FACE_BOX,
            Subject::Palm => topics::PALM_BOX,
        }
    }

    pub fn landmark_topic(self) -> &'static str {
        match self {
            Subject::Face => topics::FACE_LANDMARK,
            Subject::Palm => topics::HAND_LANDMARK,
        }
    }

    fn worker_name(self) -> &'static str {
        match self {
            Subject::Face => "face pipeline",
            Subject::Palm => "palm pipeline",
        }
    }

    pub fn reset_topic(self) -> &'static str {
        match self {
            Subject::Face => topics::FACE_RESET,
            Subject::Palm => topics::PALM_RESET,
        }
    }
}

/// Everything a [`Pipeline`] found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked {
    pub detection: Detection,
    pub landmarks: Landmarks,
    /// Only computed for faces, and only if an iris network is configured.
    pub eyes: Option<Eyes>,
    /// Only computed for faces.
    pub mouth_aspect_ratio: Option<f32>,
    /// Only computed for faces whose pose points determine a pose.
    pub head_pose: Option<HeadPose>,
    /// Only computed for hands.
    pub gesture: Option<HandGesture>,
}

/// Outcome of a single pipeline frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Tracked(Box<Tracked>),
    /// No subject; a reset was published.
    Reset,
}

/// Networks driving a [`Pipeline`].
pub struct Models {
    pub detector: Box<dyn Inferer>,
    pub landmarks: Box<dyn Inferer>,
    /// Iris network; ignored by palm pipelines.
    pub iris: Option<Arc<dyn Inferer>>,
}

/// A detector followed by a landmark network, publishing to a bus.
pub struct Pipeline {
    subject: Subject,
    boxes: BoxStage,
    roi: RoiTransformer,
    landmarks: LandmarkStage,
    iris: Option<IrisStage>,
    pose: Option<HeadPoseEstimator>,
    publisher: Publisher,
}

impl Pipeline {
    pub fn new(
        subject: Subject,
        config: &StageConfig,
        iris: Option<&IrisConfig>,
        models: Models,
        publisher: Publisher,
    ) -> Result<Self> {
        config.validate()?;
        let iris = match (subject, iris, models.iris) {
            (Subject::Face, Some(config), Some(inferer)) => {
                config.roi.validate()?;
                config.landmarks.validate()?;
                Some(IrisStage::new(config, inferer))
            }
            _ => None,
        };
        Ok(Self {
            subject,
            boxes: BoxStage::new(config.detector.clone(), config.box_filter, models.detector)?,
            roi: RoiTransformer::new(config.roi.clone()),
            landmarks: LandmarkStage::new(config.landmarks.clone(), models.landmarks),
            iris,
            pose: (subject == Subject::Face).then(HeadPoseEstimator::default),
            publisher,
        })
    }

    /// Creates a face pipeline from a full configuration.
    pub fn face(config: &PipelineConfig, models: Models, publisher: Publisher) -> Result<Self> {
        let mut pipeline = Self::new(
            Subject::Face,
            &config.face,
            Some(&config.iris),
            models,
            publisher,
        )?;
        pipeline.pose = Some(HeadPoseEstimator::new(config.camera));
        Ok(pipeline)
    }

    /// Creates a palm and hand landmark pipeline from a full configuration.
    pub fn palm(config: &PipelineConfig, models: Models, publisher: Publisher) -> Result<Self> {
        Self::new(Subject::Palm, &config.palm, None, models, publisher)
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    /// Runs the pipeline on one frame and publishes the outcome.
    ///
    /// Inference failures and configuration mismatches are returned as errors. In that case
    /// nothing is published and filter state is unchanged.
    pub fn process(&mut self, frame: &RgbImage) -> Result<FrameOutcome> {
        let detection = match self.boxes.detect(frame)? {
            StageOutcome::Detected(detection) => detection,
            StageOutcome::Reset => return Ok(self.reset("no detection")),
        };

        let alignment = self.roi.alignment_keypoints(&detection);
        let roi = match self.roi.crop(frame, &detection, alignment) {
            Ok(roi) => roi,
            Err(Error::DegenerateGeometry(reason)) => return Ok(self.reset(reason)),
            Err(e) => return Err(e),
        };
        let Some(landmarks) = self.landmarks.estimate(&roi)? else {
            return Ok(self.reset("subject not present"));
        };

        let mut tracked = Tracked {
            detection,
            landmarks,
            eyes: None,
            mouth_aspect_ratio: None,
            head_pose: None,
            gesture: None,
        };
        match self.subject {
            Subject::Face => {
                if let Some(iris) = &mut self.iris {
                    tracked.eyes = iris.estimate(frame, &tracked.landmarks)?;
                }
                if let Some(pose) = &self.pose {
                    tracked.head_pose =
                        pose.estimate(&tracked.landmarks, frame.width(), frame.height())?;
                }
                tracked.mouth_aspect_ratio = Some(mouth_aspect_ratio(&tracked.landmarks)?);
            }
            Subject::Palm => tracked.gesture = Some(classify_hand_gesture(&tracked.landmarks)?),
        }

        self.publish(&tracked)?;
        Ok(FrameOutcome::Tracked(Box::new(tracked)))
    }

    fn reset(&mut self, reason: &str) -> FrameOutcome {
        log::debug!("{}: {reason}, resetting filters", self.subject.name());
        self.boxes.reset_filters();
        self.landmarks.reset_filters();
        if let Some(iris) = &mut self.iris {
            iris.reset_filters();
        }
        self.publisher.publish_reset(self.subject.reset_topic());
        FrameOutcome::Reset
    }

    fn publish(&mut self, tracked: &Tracked) -> Result<()> {
        self.publisher
            .publish(self.subject.box_topic(), &BoxPayload::from(&tracked.detection))?;
        self.publisher
            .publish(self.subject.landmark_topic(), &points_payload(&tracked.landmarks))?;
        if let Some(ratio) = tracked.mouth_aspect_ratio {
            self.publisher.publish(topics::MOUTH_ASPECT_RATIO, &ratio)?;
        }
        if let Some(pose) = &tracked.head_pose {
            self.publisher
                .publish(topics::ROTATION, &RotationPayload::from(pose))?;
        }
        if let Some(gesture) = tracked.gesture {
            self.publisher.publish(topics::HAND_GESTURE, &gesture)?;
        }
        if let Some(eyes) = &tracked.eyes {
            let split = |lm: &Landmarks| {
                let points = points_payload(lm);
                let iris = points[crate::landmark::eye::NUM_EYE_LANDMARKS..].to_vec();
                let mut contour = points;
                contour.truncate(crate::landmark::eye::NUM_EYE_LANDMARKS);
                (contour, iris)
            };
            let (left_eye, left_iris) = split(&eyes.left);
            let (right_eye, right_iris) = split(&eyes.right);
            self.publisher
                .publish(topics::EYE_LANDMARK, &[left_eye, right_eye])?;
            self.publisher
                .publish(topics::IRIS_LANDMARK, &[left_iris, right_iris])?;
            self.publisher
                .publish(topics::EYE_ASPECT_RATIO, &eyes.aspect_ratios)?;
            self.publisher.publish(topics::GAZE, &eyes.gaze)?;
        }
        Ok(())
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        let iris = self.iris.iter().flat_map(|iris| iris.timers());
        self.boxes
            .timers()
            .into_iter()
            .chain(self.landmarks.timers())
            .chain(iris)
    }
}

/// Serialized form of a detection box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxPayload {
    pub score: f32,
    /// `[x, y, width, height]`, top-left corner and extent, normalized.
    pub rect: [f32; 4],
    pub keypoints: Vec<[f32; 2]>,
}

impl From<&Detection> for BoxPayload {
    fn from(det: &Detection) -> Self {
        let rect = det.rect();
        Self {
            score: det.score(),
            rect: [rect.x(), rect.y(), rect.width(), rect.height()],
            keypoints: det.keypoints().iter().map(|p| [p.x, p.y]).collect(),
        }
    }
}

/// Serialized form of a head pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPayload {
    /// Axis-angle rotation from the face model to the camera, in radians.
    pub rotation: [f32; 3],
    /// Face model centroid in camera space.
    pub translation: [f32; 3],
}

impl From<&HeadPose> for RotationPayload {
    fn from(pose: &HeadPose) -> Self {
        Self {
            rotation: pose.rotation_vector().into(),
            translation: pose.translation.into(),
        }
    }
}

fn points_payload(landmarks: &Landmarks) -> Vec<[f32; 3]> {
    landmarks.iter().map(|p| [p.x, p.y, p.z]).collect()
}

/// A frame handed to a pipeline worker.
pub struct FrameRequest {
    pub frame: Arc<RgbImage>,
    pub outcome: Promise<Option<FrameOutcome>>,
}

/// Handle to a [`Pipeline`] running on its own thread.
pub struct PipelineWorker {
    worker: Worker<FrameRequest>,
}

impl PipelineWorker {
    /// Queues `frame` for processing.
    ///
    /// The returned handle resolves to `None` if the frame was dropped because of an error.
    pub fn submit(&mut self, frame: Arc<RgbImage>) -> PromiseHandle<Option<FrameOutcome>> {
        let (outcome, handle) = promise();
        self.worker.send(FrameRequest { frame, outcome });
        handle
    }
}

/// Moves `pipeline` onto a dedicated worker thread.
pub fn spawn_pipeline(mut pipeline: Pipeline) -> io::Result<PipelineWorker> {
    let name = pipeline.subject().worker_name();
    let mut fps = FpsCounter::new(name);
    let worker = Worker::builder().name(name).spawn(
        move |FrameRequest { frame, outcome }: FrameRequest| {
            let result = match pipeline.process(&frame) {
                Ok(result) => Some(result),
                Err(e) => {
                    log::warn!("{}: dropping frame: {e}", pipeline.subject().name());
                    None
                }
            };
            outcome.fulfill(result);
            fps.tick_with(pipeline.timers());
        },
    )?;
    Ok(PipelineWorker { worker })
}
