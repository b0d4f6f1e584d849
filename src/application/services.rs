use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, RgbImage};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    application::ports::{DetectionModelPort, ImageSourcePort, RenderPort},
    domain::{
        config::{AppConfig, ModelConfig, VehicleConfig},
        counts::VehicleCounts,
        detection::{Detection, DetectionInfo},
        errors::{DomainError, DomainResult},
    },
};

/// Guards around the blocking inference call.
#[derive(Debug, Clone, Copy)]
pub struct InferenceLimits {
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for InferenceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_concurrent: 2,
        }
    }
}

/// Result of one detection pass over one image.
#[derive(Debug, Clone)]
pub struct VehicleDetection {
    /// Source image, normalised to 8-bit RGB.
    pub image: RgbImage,
    /// Everything the model reported above the threshold, vehicles or not.
    pub detections: Vec<Detection>,
    pub counts: VehicleCounts,
}

/// Runs the model on an image and tallies the vehicle classes.
pub struct VehicleDetector {
    model: Arc<dyn DetectionModelPort>,
    source: Arc<dyn ImageSourcePort>,
    model_config: ModelConfig,
    vehicles: VehicleConfig,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl VehicleDetector {
    pub fn new(
        model: Arc<dyn DetectionModelPort>,
        source: Arc<dyn ImageSourcePort>,
        model_config: ModelConfig,
        vehicles: VehicleConfig,
        limits: InferenceLimits,
    ) -> Self {
        Self {
            model,
            source,
            model_config,
            vehicles,
            timeout: limits.timeout,
            permits: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
        }
    }

    pub fn vehicle_config(&self) -> &VehicleConfig {
        &self.vehicles
    }

    /// Loads `source` (path or http(s) URL) and detects vehicles in it.
    pub async fn detect_vehicles(&self, source: &str) -> DomainResult<VehicleDetection> {
        let image = self.source.load(source).await?;
        self.detect_image(image).await
    }

    pub async fn detect_image(&self, image: DynamicImage) -> DomainResult<VehicleDetection> {
        let image = Arc::new(image.to_rgb8());
        let detections = self.run_model(image.clone()).await?;
        let counts = self.count(&detections);
        debug!(
            "{} detections, {} vehicles",
            detections.len(),
            counts.total()
        );

        let image = Arc::try_unwrap(image).unwrap_or_else(|shared| (*shared).clone());
        Ok(VehicleDetection {
            image,
            detections,
            counts,
        })
    }

    /// Zero-filled tally of the target classes among `detections`.
    pub fn count(&self, detections: &[Detection]) -> VehicleCounts {
        let mut counts = VehicleCounts::zeroed(&self.vehicles);
        for det in detections {
            counts.increment(&det.label);
        }
        counts
    }

    /// Vehicle detections only, each tagged with its display color.
    pub fn detection_info(&self, detections: &[Detection]) -> Vec<DetectionInfo> {
        detections
            .iter()
            .filter_map(|det| {
                let color = self.vehicles.color_for(&det.label)?;
                Some(DetectionInfo {
                    label: det.label.clone(),
                    score: det.score,
                    bbox: [det.x1, det.y1, det.x2, det.y2],
                    color: color.token().to_string(),
                })
            })
            .collect()
    }

    async fn run_model(&self, image: Arc<RgbImage>) -> DomainResult<Vec<Detection>> {
        // The permit moves into the blocking task so a timed-out call still
        // holds its slot until the model actually returns.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DomainError::Detection("inference pool closed".into()))?;
        let model = self.model.clone();
        let threshold = self.model_config.confidence_threshold;

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.detect(&image, threshold)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(DomainError::Detection(format!(
                "inference timed out after {:?}",
                self.timeout
            ))),
            Ok(Err(join)) => Err(DomainError::Detection(format!("inference task failed: {join}"))),
            Ok(Ok(Err(DomainError::Detection(msg)))) => Err(DomainError::Detection(msg)),
            Ok(Ok(Err(other))) => Err(DomainError::Detection(other.to_string())),
            Ok(Ok(Ok(detections))) => Ok(detections),
        }
    }
}

/// What the UI gets back for one request. Never an error: failures are in-band.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub image_png: Option<Vec<u8>>,
    pub summary: String,
    pub counts: Option<VehicleCounts>,
    pub detections: Vec<DetectionInfo>,
}

impl ProcessOutcome {
    pub fn error(err: &DomainError) -> Self {
        Self {
            image_png: None,
            summary: format!("Error: {err}"),
            counts: None,
            detections: Vec::new(),
        }
    }

    #[cfg(test)]
    fn is_error(&self) -> bool {
        self.image_png.is_none()
    }
}

/// Upload in, annotated image and summary out.
pub struct VehicleCountingService {
    detector: Arc<VehicleDetector>,
    renderer: Arc<dyn RenderPort>,
    app_config: AppConfig,
}

impl VehicleCountingService {
    pub fn new(detector: Arc<VehicleDetector>, renderer: Arc<dyn RenderPort>, app_config: AppConfig) -> Self {
        Self {
            detector,
            renderer,
            app_config,
        }
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn vehicle_config(&self) -> &VehicleConfig {
        self.detector.vehicle_config()
    }

    /// Processes an uploaded image held in memory.
    pub async fn process(&self, bytes: Vec<u8>) -> ProcessOutcome {
        let result = async {
            let image = tokio::task::spawn_blocking(move || decode_image(&bytes))
                .await
                .map_err(|e| DomainError::ImageLoad(e.to_string()))??;
            let detection = self.detector.detect_image(image).await?;
            self.render(detection).await
        }
        .await;
        Self::finish(result)
    }

    /// Processes a path or URL.
    pub async fn process_source(&self, source: &str) -> ProcessOutcome {
        let result = async {
            let detection = self.detector.detect_vehicles(source).await?;
            self.render(detection).await
        }
        .await;
        Self::finish(result)
    }

    /// Runs the configured example at `index`; `None` if there is no such example.
    pub async fn process_example(&self, index: usize) -> Option<ProcessOutcome> {
        let source = self.app_config.examples.get(index)?;
        Some(self.process_source(source).await)
    }

    async fn render(&self, detection: VehicleDetection) -> DomainResult<ProcessOutcome> {
        let summary = detection.counts.summary_text();
        let counts = detection.counts.clone();
        let detections = self.detector.detection_info(&detection.detections);
        let renderer = self.renderer.clone();

        let png = tokio::task::spawn_blocking(move || {
            let rendered = renderer.render(&detection.image, &detection.detections, &detection.counts)?;
            encode_png(&rendered)
        })
        .await
        .map_err(|e| DomainError::Rendering(e.to_string()))??;

        Ok(ProcessOutcome {
            image_png: Some(png),
            summary,
            counts: Some(counts),
            detections,
        })
    }

    fn finish(result: DomainResult<ProcessOutcome>) -> ProcessOutcome {
        match result {
            Ok(outcome) => {
                info!("Processed image: {}", outcome.summary.replace('\n', " ").trim_end());
                outcome
            }
            Err(e) => {
                warn!("Request failed: {e}");
                ProcessOutcome::error(&e)
            }
        }
    }
}

/// Decodes any format the `image` crate recognises from its magic bytes.
pub fn decode_image(bytes: &[u8]) -> DomainResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| DomainError::ImageLoad(e.to_string()))
}

pub fn encode_png(image: &RgbImage) -> DomainResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| DomainError::Rendering(e.to_string()))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed detection list, thresholded like a real model.
    struct ScriptedModel {
        detections: Vec<Detection>,
        calls: AtomicUsize,
    }

    impl DetectionModelPort for ScriptedModel {
        fn detect(&self, _image: &RgbImage, threshold: f32) -> DomainResult<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .detections
                .iter()
                .filter(|d| d.score >= threshold)
                .cloned()
                .collect())
        }
    }

    struct FailingModel;

    impl DetectionModelPort for FailingModel {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> DomainResult<Vec<Detection>> {
            Err(DomainError::InvalidInput("bad tensor".into()))
        }
    }

    struct PanickingModel;

    impl DetectionModelPort for PanickingModel {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> DomainResult<Vec<Detection>> {
            panic!("runtime exploded")
        }
    }

    struct SlowModel;

    impl DetectionModelPort for SlowModel {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> DomainResult<Vec<Detection>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }
    }

    /// Tracks how many calls run at once and the highest count seen.
    struct GaugedModel {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        first_call_delay: Duration,
        delay: Duration,
    }

    impl GaugedModel {
        fn new(first_call_delay: Duration, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                first_call_delay,
                delay,
            })
        }
    }

    impl DetectionModelPort for GaugedModel {
        fn detect(&self, _image: &RgbImage, _threshold: f32) -> DomainResult<Vec<Detection>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.first_call_delay
            } else {
                self.delay
            };
            std::thread::sleep(delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    /// Serves one in-memory image for any source except "missing".
    struct MemorySource;

    #[async_trait]
    impl ImageSourcePort for MemorySource {
        async fn load(&self, source: &str) -> DomainResult<DynamicImage> {
            if source == "missing" {
                return Err(DomainError::ImageLoad(format!("{source}: not found")));
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(160, 120, Rgb([40, 40, 40]))))
        }
    }

    struct IdentityRenderer;

    impl RenderPort for IdentityRenderer {
        fn render(&self, image: &RgbImage, _: &[Detection], _: &VehicleCounts) -> DomainResult<RgbImage> {
            Ok(image.clone())
        }
    }

    fn det(label: &str, score: f32, b: [f32; 4]) -> Detection {
        Detection {
            x1: b[0],
            y1: b[1],
            x2: b[2],
            y2: b[3],
            score,
            class_id: 0,
            label: label.to_string(),
        }
    }

    fn street_scene() -> Vec<Detection> {
        vec![
            det("car", 0.91, [10.0, 10.0, 50.0, 50.0]),
            det("dog", 0.95, [0.0, 0.0, 5.0, 5.0]),
            det("truck", 0.72, [60.0, 60.0, 120.0, 100.0]),
            det("car", 0.40, [70.0, 10.0, 90.0, 30.0]),
        ]
    }

    fn detector_with(model: Arc<dyn DetectionModelPort>, limits: InferenceLimits) -> VehicleDetector {
        VehicleDetector::new(
            model,
            Arc::new(MemorySource),
            ModelConfig::default(),
            VehicleConfig::default(),
            limits,
        )
    }

    fn detector(model: Arc<dyn DetectionModelPort>) -> VehicleDetector {
        detector_with(model, InferenceLimits::default())
    }

    fn scripted(detections: Vec<Detection>) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel {
            detections,
            calls: AtomicUsize::new(0),
        })
    }

    fn service(model: Arc<dyn DetectionModelPort>) -> VehicleCountingService {
        VehicleCountingService::new(
            Arc::new(detector(model)),
            Arc::new(IdentityRenderer),
            AppConfig {
                examples: vec!["street.jpg".into(), "missing".into()],
                ..AppConfig::default()
            },
        )
    }

    fn png_bytes() -> Vec<u8> {
        encode_png(&RgbImage::from_pixel(32, 24, Rgb([200, 10, 10]))).unwrap()
    }

    #[tokio::test]
    async fn counts_street_scene() -> anyhow::Result<()> {
        let d = detector(scripted(street_scene()));
        let result = d.detect_vehicles("street.jpg").await?;

        let counts: Vec<_> = result.counts.iter().collect();
        assert_eq!(counts, [("car", 1), ("truck", 1), ("motorcycle", 0)]);
        // non-vehicles stay in the raw result, below-threshold ones do not
        assert_eq!(result.detections.len(), 3);
        assert!(result.detections.iter().any(|d| d.label == "dog"));
        assert_eq!(result.image.dimensions(), (160, 120));
        Ok(())
    }

    #[tokio::test]
    async fn empty_scene_is_zero_filled() -> anyhow::Result<()> {
        let d = detector(scripted(Vec::new()));
        let result = d.detect_vehicles("street.jpg").await?;
        let keys: Vec<_> = result.counts.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["car", "truck", "motorcycle"]);
        assert_eq!(result.counts.total(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_runs_agree() -> anyhow::Result<()> {
        let model = scripted(street_scene());
        let d = detector(model.clone());
        let first = d.detect_vehicles("street.jpg").await?;
        let second = d.detect_vehicles("street.jpg").await?;
        assert_eq!(first.counts, second.counts);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn load_failures_stay_image_load_errors() {
        let model = scripted(street_scene());
        let err = detector(model.clone()).detect_vehicles("missing").await.unwrap_err();
        assert!(matches!(err, DomainError::ImageLoad(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn model_failures_become_detection_errors() {
        let err = detector(Arc::new(FailingModel))
            .detect_vehicles("street.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Detection(_)));
        assert!(err.to_string().contains("bad tensor"));

        let err = detector(Arc::new(PanickingModel))
            .detect_vehicles("street.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Detection(_)));
    }

    #[tokio::test]
    async fn slow_inference_times_out() {
        let limits = InferenceLimits {
            timeout: Duration::from_millis(20),
            max_concurrent: 1,
        };
        let err = detector_with(Arc::new(SlowModel), limits)
            .detect_vehicles("street.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Detection(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_are_capped_by_permits() {
        let model = GaugedModel::new(Duration::from_millis(50), Duration::from_millis(50));
        let limits = InferenceLimits {
            timeout: Duration::from_secs(10),
            max_concurrent: 2,
        };
        let d = Arc::new(detector_with(model.clone(), limits));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.detect_vehicles("street.jpg").await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(model.calls.load(Ordering::SeqCst), 6);
        let peak = model.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in-flight was {peak}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timed_out_call_holds_its_permit_until_the_model_returns() {
        let model = GaugedModel::new(Duration::from_millis(400), Duration::ZERO);
        let limits = InferenceLimits {
            timeout: Duration::from_millis(100),
            max_concurrent: 1,
        };
        let d = detector_with(model.clone(), limits);

        let started = std::time::Instant::now();
        let err = d.detect_vehicles("street.jpg").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_millis(400));

        // the abandoned call is still running, so this one waits for its slot
        d.detect_vehicles("street.jpg").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(390));
        assert_eq!(model.peak.load(Ordering::SeqCst), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn detection_info_keeps_vehicles_with_colors() {
        let d = detector(scripted(Vec::new()));
        let info = d.detection_info(&street_scene());
        assert_eq!(info.len(), 3);
        assert_eq!(info[0].label, "car");
        assert_eq!(info[0].color, "red");
        assert_eq!(info[0].bbox, [10.0, 10.0, 50.0, 50.0]);
        assert_eq!(info[1].label, "truck");
        assert_eq!(info[1].color, "blue");
    }

    #[tokio::test]
    async fn process_returns_image_and_summary() {
        let svc = service(scripted(street_scene()));
        let outcome = svc.process(png_bytes()).await;

        assert!(!outcome.is_error());
        assert_eq!(outcome.summary, "Vehicle Counts:\nCar: 1\nTruck: 1\nMotorcycle: 0\n");
        let png = outcome.image_png.unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[tokio::test]
    async fn process_reports_errors_in_band() {
        let svc = service(scripted(street_scene()));
        let outcome = svc.process(b"definitely not an image".to_vec()).await;
        assert!(outcome.is_error());
        assert!(outcome.summary.starts_with("Error: "));
        assert!(outcome.counts.is_none());

        let outcome = service(Arc::new(FailingModel)).process(png_bytes()).await;
        assert!(outcome.is_error());
        assert!(outcome.summary.starts_with("Error: Error during detection"));
    }

    #[tokio::test]
    async fn examples_are_looked_up_by_index() {
        let svc = service(scripted(street_scene()));
        let ok = svc.process_example(0).await.unwrap();
        assert!(!ok.is_error());
        let failed = svc.process_example(1).await.unwrap();
        assert!(failed.summary.starts_with("Error: Error loading image"));
        assert!(svc.process_example(7).await.is_none());
    }
}
