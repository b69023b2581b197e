//! ResizeProcessor - `resize-image` タスクの実処理
//!
//! # 流れ
//! 1. payload 検証（`imageUrl`, `width`, `height`）
//! 2. `image/{taskId}.jpg` が既にあれば署名付き URL (1h) を返して終了
//! 3. ダウンロード → デコード → Lanczos3 で縮小 → JPEG エンコード（blocking pool）
//! 4. アップロード → 署名付き URL (24h)
//!
//! 失敗は全て `ProcessFailure` で、`stage` が失敗した段階を表す。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use resizer_core::domain::{Payload, ProcessFailure, ProcessSuccess};
use resizer_core::observability::WorkerMetrics;
use resizer_core::ports::TaskProcessor;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::source::ImageSource;
use super::storage::ObjectStore;

pub const STAGE_PAYLOAD: &str = "payload";
pub const STAGE_DOWNLOAD: &str = "download";
pub const STAGE_DECODE: &str = "decode";
pub const STAGE_ENCODE: &str = "encode";
pub const STAGE_UPLOAD: &str = "upload";
pub const STAGE_PRESIGN: &str = "presign";

/// URL lifetime when the object was already in storage.
pub const EXISTING_URL_EXPIRY: Duration = Duration::from_secs(60 * 60);
/// URL lifetime for a freshly uploaded object.
pub const FRESH_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const JPEG_QUALITY: u8 = 95;
const CONTENT_TYPE_JPEG: &str = "image/jpeg";

/// `width` / `height` of 0 keep the aspect ratio; at least one must be set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    pub image_url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl ResizePayload {
    pub fn from_payload(payload: &Payload) -> Result<Self, ProcessFailure> {
        let parsed: Self = serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| ProcessFailure::new(STAGE_PAYLOAD, e.to_string()))?;
        if parsed.image_url.trim().is_empty() {
            return Err(ProcessFailure::new(STAGE_PAYLOAD, "imageUrl is empty"));
        }
        if parsed.width == 0 && parsed.height == 0 {
            return Err(ProcessFailure::new(
                STAGE_PAYLOAD,
                "at least one of width and height must be positive",
            ));
        }
        Ok(parsed)
    }
}

pub fn object_key(task_id: &str) -> String {
    format!("image/{task_id}.jpg")
}

/// Output size for a `width` x `height` request on a `src_w` x `src_h` image.
pub fn target_dimensions(src_w: u32, src_h: u32, width: u32, height: u32) -> (u32, u32) {
    let scale = |len: u32, num: u32, den: u32| -> u32 {
        if den == 0 {
            return len.max(1);
        }
        let scaled = (f64::from(len) * f64::from(num) / f64::from(den)).round();
        (scaled as u32).max(1)
    };
    match (width, height) {
        (0, 0) => (src_w.max(1), src_h.max(1)),
        (0, h) => (scale(src_w, h, src_h), h),
        (w, 0) => (w, scale(src_h, w, src_w)),
        (w, h) => (w, h),
    }
}

/// Decode, resize and re-encode as JPEG. CPU bound; run on the blocking pool.
pub fn resize_to_jpeg(
    source: &[u8],
    width: u32,
    height: u32,
) -> Result<(Vec<u8>, u32, u32), ProcessFailure> {
    let img = image::load_from_memory(source)
        .map_err(|e| ProcessFailure::new(STAGE_DECODE, e.to_string()))?;
    let (w, h) = target_dimensions(img.width(), img.height(), width, height);
    let resized = img.resize_exact(w, h, FilterType::Lanczos3);

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
        .map_err(|e| ProcessFailure::new(STAGE_ENCODE, e.to_string()))?;
    Ok((out, w, h))
}

pub struct ResizeProcessor {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn ImageSource>,
    metrics: Arc<WorkerMetrics>,
    task_type: String,
}

impl ResizeProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn ImageSource>,
        metrics: Arc<WorkerMetrics>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            metrics,
            task_type: task_type.into(),
        }
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, ProcessFailure> {
        self.store.presign_get(key, expires_in).await.map_err(|e| {
            self.metrics.record_upload_failure(&self.task_type);
            ProcessFailure::new(STAGE_PRESIGN, e.to_string())
        })
    }
}

#[async_trait]
impl TaskProcessor for ResizeProcessor {
    async fn process(
        &self,
        task_id: &str,
        payload: &Payload,
    ) -> Result<ProcessSuccess, ProcessFailure> {
        let request = ResizePayload::from_payload(payload)?;
        let key = object_key(task_id);

        match self.store.exists(&key).await {
            Ok(true) => {
                let url = self.presign(&key, EXISTING_URL_EXPIRY).await?;
                info!(task_id, %key, "resized image already in storage");
                return Ok(ProcessSuccess::new(url).with_metadata("cached", true));
            }
            Ok(false) => {}
            Err(e) => warn!(task_id, %key, error = %e, "existence check failed, resizing anyway"),
        }

        info!(
            task_id,
            width = request.width,
            height = request.height,
            image_url = %request.image_url,
            "resizing image"
        );
        let source = self
            .source
            .fetch(&request.image_url)
            .await
            .map_err(|e| ProcessFailure::new(STAGE_DOWNLOAD, e.to_string()))?;

        let (width, height) = (request.width, request.height);
        let (jpeg, out_w, out_h) =
            tokio::task::spawn_blocking(move || resize_to_jpeg(&source, width, height))
                .await
                .map_err(|e| ProcessFailure::new(STAGE_ENCODE, e.to_string()))??;

        if let Err(e) = self.store.put(&key, jpeg, CONTENT_TYPE_JPEG).await {
            self.metrics.record_upload_failure(&self.task_type);
            return Err(ProcessFailure::new(STAGE_UPLOAD, e.to_string()));
        }
        let url = self.presign(&key, FRESH_URL_EXPIRY).await?;

        info!(task_id, %key, width = out_w, height = out_h, "resized image uploaded");
        Ok(ProcessSuccess::new(url)
            .with_metadata("width", out_w)
            .with_metadata("height", out_h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::source::SourceError;
    use crate::processor::storage::testing::MemoryStore;
    use image::{ImageFormat, Rgba, RgbaImage};
    use reqwest::StatusCode;
    use rstest::rstest;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    const LABEL: &str = "resize-image";

    struct FakeSource {
        body: Result<Vec<u8>, StatusCode>,
        calls: AtomicU32,
    }

    impl FakeSource {
        fn serving(body: Vec<u8>) -> Self {
            Self {
                body: Ok(body),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(status: StatusCode) -> Self {
            Self {
                body: Err(status),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body.clone().map_err(SourceError::Status)
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn request(width: u32, height: u32) -> Payload {
        payload(json!({"imageUrl": "http://img/a.png", "width": width, "height": height}))
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        source: Arc<FakeSource>,
        metrics: Arc<WorkerMetrics>,
        processor: ResizeProcessor,
    }

    fn fixture(source: FakeSource) -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(source);
        let metrics = Arc::new(WorkerMetrics::new().unwrap());
        let processor = ResizeProcessor::new(store.clone(), source.clone(), metrics.clone(), LABEL);
        Fixture {
            store,
            source,
            metrics,
            processor,
        }
    }

    #[rstest]
    #[case::missing_url(json!({"width": 10}))]
    #[case::empty_url(json!({"imageUrl": " ", "width": 10}))]
    #[case::no_dimensions(json!({"imageUrl": "http://img/a.png"}))]
    #[case::both_zero(json!({"imageUrl": "http://img/a.png", "width": 0, "height": 0}))]
    #[case::negative(json!({"imageUrl": "http://img/a.png", "width": -5, "height": 10}))]
    #[case::text_width(json!({"imageUrl": "http://img/a.png", "width": "wide"}))]
    fn test_invalid_payload(#[case] value: Value) {
        let failure = ResizePayload::from_payload(&payload(value)).unwrap_err();
        assert_eq!(failure.stage, STAGE_PAYLOAD);
    }

    #[test]
    fn test_payload_parses_single_dimension() {
        let parsed =
            ResizePayload::from_payload(&payload(json!({"imageUrl": "http://x/y.gif", "height": 64})))
                .unwrap();
        assert_eq!(parsed.width, 0);
        assert_eq!(parsed.height, 64);
    }

    #[rstest]
    #[case::width_only(40, 20, 20, 0, (20, 10))]
    #[case::height_only(40, 20, 0, 10, (20, 10))]
    #[case::both(40, 20, 10, 10, (10, 10))]
    #[case::never_zero(3, 1000, 0, 1, (1, 1))]
    #[case::upscale(10, 10, 0, 30, (30, 30))]
    fn test_target_dimensions(
        #[case] src_w: u32,
        #[case] src_h: u32,
        #[case] width: u32,
        #[case] height: u32,
        #[case] expected: (u32, u32),
    ) {
        assert_eq!(target_dimensions(src_w, src_h, width, height), expected);
    }

    #[tokio::test]
    async fn test_fresh_image_is_resized_and_uploaded() {
        let f = fixture(FakeSource::serving(png(40, 20)));

        let success = f.processor.process("t-1", &request(20, 0)).await.unwrap();

        let (body, content_type) = f.store.object("image/t-1.jpg").unwrap();
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Jpeg);
        let uploaded = image::load_from_memory(&body).unwrap();
        assert_eq!((uploaded.width(), uploaded.height()), (20, 10));

        assert!(success.output_url.ends_with("X-Amz-Expires=86400"));
        assert_eq!(success.metadata["width"], json!(20));
        assert_eq!(success.metadata["height"], json!(10));
        assert!(!success.metadata.contains_key("cached"));
    }

    #[tokio::test]
    async fn test_existing_object_skips_download() {
        let f = fixture(FakeSource::serving(png(8, 8)));
        f.store.insert("image/t-1.jpg", vec![1, 2, 3]);

        let success = f.processor.process("t-1", &request(4, 4)).await.unwrap();

        assert_eq!(f.source.calls(), 0);
        assert_eq!(success.metadata["cached"], json!(true));
        assert!(success.output_url.ends_with("X-Amz-Expires=3600"));
    }

    #[tokio::test]
    async fn test_existence_check_failure_falls_through_to_resize() {
        let f = fixture(FakeSource::serving(png(8, 8)));
        f.store.fail_head(true);

        let success = f.processor.process("t-1", &request(4, 4)).await.unwrap();

        assert_eq!(f.source.calls(), 1);
        assert!(f.store.object("image/t-1.jpg").is_some());
        assert!(success.output_url.contains("image/t-1.jpg"));
    }

    #[tokio::test]
    async fn test_download_failure() {
        let f = fixture(FakeSource::failing(StatusCode::NOT_FOUND));

        let failure = f.processor.process("t-1", &request(4, 4)).await.unwrap_err();

        assert_eq!(failure.stage, STAGE_DOWNLOAD);
        assert!(failure.reason.contains("404"), "{}", failure.reason);
        assert!(f.store.object("image/t-1.jpg").is_none());
        assert_eq!(f.metrics.upload_failures(LABEL), 0);
    }

    #[tokio::test]
    async fn test_undecodable_image() {
        let f = fixture(FakeSource::serving(b"<html>not an image</html>".to_vec()));

        let failure = f.processor.process("t-1", &request(4, 4)).await.unwrap_err();

        assert_eq!(failure.stage, STAGE_DECODE);
        assert!(f.store.object("image/t-1.jpg").is_none());
    }

    #[tokio::test]
    async fn test_upload_failure_is_counted() {
        let f = fixture(FakeSource::serving(png(8, 8)));
        f.store.fail_uploads(true);

        let failure = f.processor.process("t-1", &request(4, 4)).await.unwrap_err();

        assert_eq!(failure.stage, STAGE_UPLOAD);
        assert_eq!(f.metrics.upload_failures(LABEL), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_touches_nothing() {
        let f = fixture(FakeSource::serving(png(8, 8)));

        let failure = f
            .processor
            .process("t-1", &payload(json!({"imageUrl": "http://img/a.png"})))
            .await
            .unwrap_err();

        assert_eq!(failure.stage, STAGE_PAYLOAD);
        assert_eq!(f.source.calls(), 0);
    }
}
