use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::error::ProcessingError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::{self, DType};
use crate::narrow;
use crate::operation::{self, Operation};
use crate::operations;
use crate::tiff_file;
use crate::validated::{ValidatedJson, ValidatedQuery};
use crate::volume::ImageVolume;

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ndarray::{ArrayView, Dimension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiff::encoder::colortype;
use tokio::io::AsyncWriteExt;
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;

/// `x-hyperstack-dtype` header definition
static HEADER_DTYPE: header::HeaderName = header::HeaderName::from_static("x-hyperstack-dtype");
/// `x-hyperstack-shape` header definition
static HEADER_SHAPE: header::HeaderName = header::HeaderName::from_static("x-hyperstack-shape");

/// File extensions accepted for upload
const ALLOWED_EXTENSIONS: [&str; 2] = ["tif", "tiff"];

impl IntoResponse for models::TiffDownload {
    /// Convert from a [models::TiffDownload] into an [axum::response::Response].
    fn into_response(self) -> Response {
        let shape = serde_json::to_string(&self.shape).unwrap_or_default();
        (
            [
                (&header::CONTENT_TYPE, "image/tiff".to_string()),
                (
                    &header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", self.filename),
                ),
                (&HEADER_DTYPE, self.dtype.to_string()),
                (&HEADER_SHAPE, shape),
            ],
            self.body,
        )
            .into_response()
    }
}

/// Application service type
///
/// The [NormalizePath] middleware strips trailing slashes before routing.
pub type Service = NormalizePath<Router>;

/// Initialise the application
///
/// Sizes the global Rayon thread pool used for CPU-bound processing.
pub fn init(args: &CommandLineArgs) {
    let threads = args.thread_limit.unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .expect("failed to initialise Rayon thread pool");
}

/// Returns a [axum::Router] with all routes
///
/// # Arguments
///
/// * `state`: Shared application state
fn router(state: SharedAppState) -> Router {
    let max_upload_bytes = state.args.max_upload_bytes();
    Router::new()
        .route("/upload", post(upload))
        .route("/metadata", get(metadata))
        .route("/slice", get(slice))
        .route("/analyze", post(analyze))
        .route("/statistics", get(statistics))
        .route("/segment/kmeans", get(segment))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
        .route("/metrics", get(metrics_handler))
        .layer(
            TraceLayer::new_for_http()
                .on_request(request_counter)
                .on_response(record_response_metrics),
        )
}

/// Returns a [Service] with all routes and middleware
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn service(args: &CommandLineArgs) -> Service {
    let state = AppState::new(args).expect("failed to initialise application state");
    service_with_state(Arc::new(state))
}

/// Returns a [Service] for existing application state
fn service_with_state(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Resolve a requested image file, which must exist.
fn existing_file(file_path: &str) -> Result<PathBuf, ProcessingError> {
    let path = PathBuf::from(file_path);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ProcessingError::FileNotFound {
            path: file_path.to_string(),
        })
    }
}

/// Path of a derived output, named after the input file and the operation parameters.
fn output_path(state: &AppState, input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    state.data_dir().join(format!("{}_{}.tif", stem, suffix))
}

fn axis_label(index: Option<isize>) -> String {
    index.map_or_else(|| "all".to_string(), |index| index.to_string())
}

/// Make an uploaded file name safe to use as a file name in the data directory.
///
/// Drops any directory components, joins whitespace separated words with underscores and
/// removes characters other than ASCII alphanumerics, `.`, `_` and `-`.
fn secure_filename(filename: &str) -> String {
    let base = filename.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    let joined = base.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches(&['.', '_'][..]).to_string()
}

fn allowed_file(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, extension)) => ALLOWED_EXTENSIONS.contains(&extension.to_lowercase().as_str()),
        None => false,
    }
}

/// Run CPU-bound work away from the async runtime.
///
/// Uses the Rayon pool when enabled, otherwise Tokio's blocking pool.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ProcessingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProcessingError> + Send + 'static,
{
    if state.args.use_rayon {
        tokio_rayon::spawn(f).await
    } else {
        tokio::task::spawn_blocking(f).await?
    }
}

/// Narrow an array to `u8` and write it, one page per leading index.
fn write_u8<S, D>(path: &Path, array: &ndarray::ArrayBase<S, D>) -> Result<Vec<usize>, ProcessingError>
where
    S: ndarray::Data,
    S::Elem: num_traits::AsPrimitive<f64>,
    D: Dimension,
{
    let narrowed = narrow::to_u8(array);
    let view: ArrayView<u8, D> = narrowed.view();
    let leading_axes = view.ndim().saturating_sub(2);
    tiff_file::write_volume::<colortype::Gray8, D>(path, view, leading_axes)?;
    Ok(narrowed.shape().to_vec())
}

/// Stream an uploaded file field to disk.
async fn save_upload(field: &mut Field<'_>, path: &Path) -> Result<(), ProcessingError> {
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Remove what is left of a failed upload, if anything.
async fn discard_upload(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), "failed to remove upload: {}", error);
        }
    }
}

/// Upload a 5D TIFF image.
///
/// The file is removed again if it cannot be received in full or is not a 5D TIFF image.
async fn upload(
    State(state): State<SharedAppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<models::UploadResponse>), ProcessingError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = secure_filename(field.file_name().unwrap_or_default());
        if filename.is_empty() {
            return Err(ProcessingError::NoFileProvided);
        }
        if !allowed_file(&filename) {
            return Err(ProcessingError::InvalidFileType { filename });
        }

        let path = state.data_dir().join(&filename);
        if let Err(error) = save_upload(&mut field, &path).await {
            tracing::error!(path = %path.display(), "failed to receive upload: {}", error);
            discard_upload(&path).await;
            return Err(error);
        }
        tracing::debug!(path = %path.display(), "saved upload");

        let policy = state.args.chunk_policy();
        let loaded = path.clone();
        let volume = match run_blocking(&state, move || ImageVolume::open(&loaded, policy)).await {
            Ok(volume) => volume,
            Err(error) => {
                tracing::error!(path = %path.display(), "rejected upload: {}", error);
                discard_upload(&path).await;
                return Err(error);
            }
        };

        let file_path = path.display().to_string();
        let record = models::ImageMetadataRecord::new(file_path.clone(), volume.shape(), volume.dtype());
        if state.store.upsert_metadata(&record)? {
            tracing::info!(file_path, "updated existing metadata");
        }
        return Ok((
            StatusCode::CREATED,
            Json(models::UploadResponse {
                message: "File uploaded successfully".to_string(),
                file_path,
            }),
        ));
    }
    Err(ProcessingError::NoFileProvided)
}

/// Shape, data type and value range of an image.
async fn metadata(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<models::FileQuery>,
) -> Result<Json<models::MetadataResponse>, ProcessingError> {
    let path = existing_file(&query.file_path)?;
    let policy = state.args.chunk_policy();
    let metadata = run_blocking(&state, move || {
        operation::process(&path, policy, &operations::Describe {})
    })
    .await?;
    Ok(Json(models::MetadataResponse { metadata }))
}

/// Extract a slice, save it and return it as a TIFF file.
async fn slice(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<models::SliceQuery>,
) -> Result<models::TiffDownload, ProcessingError> {
    let path = existing_file(&query.file_path)?;
    let selector = query.selector();
    let suffix = format!(
        "slice_z{}_t{}_c{}",
        axis_label(selector.z),
        axis_label(selector.time),
        axis_label(selector.channel)
    );
    let output = output_path(&state, &path, &suffix);
    let policy = state.args.chunk_policy();
    let (body, shape) = run_blocking(&state, move || {
        let slice = operation::process(&path, policy, &operations::Slice { selector })?;
        let shape = write_u8(&output, &slice)?;
        Ok((std::fs::read(&output)?, shape))
    })
    .await?;
    Ok(models::TiffDownload {
        body,
        filename: format!("{}.tif", suffix),
        shape,
        dtype: DType::Uint8,
    })
}

/// Reduce the channels of an image by PCA and save the result.
async fn analyze(
    State(state): State<SharedAppState>,
    ValidatedJson(request): ValidatedJson<models::AnalyzeRequest>,
) -> Result<Json<models::AnalyzeResponse>, ProcessingError> {
    let path = existing_file(&request.file_path)?;
    let components = request.components;
    let output = output_path(&state, &path, &format!("pca_{}", components));
    let policy = state.args.chunk_policy();
    let written = output.clone();
    let model = run_blocking(&state, move || {
        let pca = operation::process(&path, policy, &operations::Pca { components })?;
        write_u8(&written, &pca.data)?;
        Ok(pca.model)
    })
    .await?;

    state.store.record_analysis(&models::ImageAnalysisRecord {
        file_path: request.file_path,
        pca_components: Some(components),
        statistics: None,
    })?;
    Ok(Json(models::AnalyzeResponse {
        message: "PCA analysis completed".to_string(),
        file_path: output.display().to_string(),
        explained_variance_ratio: model.explained_variance_ratio,
    }))
}

/// Per-channel statistics of an image.
async fn statistics(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<models::FileQuery>,
) -> Result<Json<models::StatisticsResponse>, ProcessingError> {
    let path = existing_file(&query.file_path)?;
    let policy = state.args.chunk_policy();
    let statistics = run_blocking(&state, move || {
        operation::process(&path, policy, &operations::Statistics {})
    })
    .await?;

    state.store.record_analysis(&models::ImageAnalysisRecord {
        file_path: query.file_path,
        pca_components: None,
        statistics: Some(serde_json::to_value(&statistics)?),
    })?;
    Ok(Json(models::StatisticsResponse { statistics }))
}

/// Segment one channel of an image by k-means and save the labels.
async fn segment(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<models::SegmentQuery>,
) -> Result<Json<models::SegmentResponse>, ProcessingError> {
    let path = existing_file(&query.file_path)?;
    let operation = operations::KMeansSegmentation {
        channel: query.channel,
        k: query.k,
        params: state.args.kmeans_params(),
    };
    let output = output_path(
        &state,
        &path,
        &format!("kmeans_c{}_k{}", query.channel, query.k),
    );
    let policy = state.args.chunk_policy();
    let written = output.clone();
    run_blocking(&state, move || {
        let segmentation = operation::process(&path, policy, &operation)?;
        tracing::debug!(
            operation = operations::KMeansSegmentation::NAME,
            centres = ?segmentation.model.centres,
            inertia = segmentation.model.inertia,
            "fitted k-means model"
        );
        write_u8(&written, &segmentation.labels)?;
        Ok(())
    })
    .await?;
    Ok(Json(models::SegmentResponse {
        file_path: output.display().to_string(),
    }))
}
