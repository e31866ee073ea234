//! HTTP surface: book ingestion and retrieval, chapter HTML and audio,
//! job-spawning mutations, server-sent progress events, and EPUB 3 export.
//!
//! Request handlers only register jobs and read committed state; every
//! mutation runs under the controller's key mutexes. Disconnecting from the
//! event stream never cancels a job; cancellation is its own endpoint.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::align::{
    AlignBackend, AlignMode, CommandAligner, DtwAligner, PassthroughAligner,
};
use crate::audio::{
    AudioCodec, AudioSourceManager, CommandTranslator, EspeakEngine, FfmpegCodec, TtsEngine,
    Voice, VoiceCatalog, WavCodec, voice_language,
};
use crate::book::{AudioFormat, Book, ChapterMeta, SyncTable};
use crate::config::Config;
use crate::edit::{AudioEditor, EditOutcome};
use crate::error::{Error, Result};
use crate::export::export_book;
use crate::ingest::ingest_book;
use crate::normalize::render_plain_tokens;
use crate::pipeline::{
    Controller, Job, JobKind, OpClass, TargetKey, fingerprint_alignment, fingerprint_translation,
    fingerprint_tts, token_table_hash,
};
use crate::progress::ProgressEvent;
use crate::store::{BlobStore, FsBlobStore, MetadataStore, load_json, paths, save_json};
use crate::util::sha1_hex;

// ============================================================================
// State
// ============================================================================

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn BlobStore>,
    pub meta: MetadataStore,
    pub controller: Arc<Controller>,
    pub sources: Arc<AudioSourceManager>,
    pub editor: Arc<AudioEditor>,
    pub tts: Arc<dyn TtsEngine>,
    pub catalog: Arc<VoiceCatalog>,
}

/// Wire up stores, engines, and the controller from configuration.
pub fn build_state(config: Config) -> Result<Arc<AppState>> {
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.storage_root)?);

    let codec: Arc<dyn AudioCodec> = match config.canonical_format {
        AudioFormat::Wav => Arc::new(WavCodec::new(config.sample_rate)),
        AudioFormat::Mp3 => Arc::new(FfmpegCodec::new(
            config.ffmpeg_command.as_str(),
            config.ffprobe_command.as_str(),
            config.sample_rate,
            AudioFormat::Mp3,
        )),
    };
    let tts: Arc<dyn TtsEngine> = Arc::new(EspeakEngine::new(
        config.tts_command.as_str(),
        config.tts_timeout(),
    ));
    let catalog = Arc::new(VoiceCatalog::initialize(tts.as_ref()));
    let translator = config.translator_command.as_deref().map(|command| {
        Arc::new(CommandTranslator::new(command, config.translate_timeout()))
            as Arc<dyn crate::audio::Translator>
    });

    let sources = Arc::new(AudioSourceManager::new(
        Arc::clone(&store),
        Arc::clone(&codec),
        Arc::clone(&tts),
        translator,
        Arc::clone(&catalog),
    ));
    let editor = Arc::new(AudioEditor::new(Arc::clone(&store), Arc::clone(&codec)));
    let controller = Controller::new(config.clone());

    Ok(Arc::new(AppState {
        meta: MetadataStore::new(Arc::clone(&store)),
        store,
        controller,
        sources,
        editor,
        tts,
        catalog,
        config,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/books", post(ingest).get(list_books))
        .route("/books/:book", get(get_book).delete(remove_book))
        .route("/books/:book/chapters/:chapter/html", get(chapter_html))
        .route(
            "/books/:book/chapters/:chapter/audio",
            get(audio_descriptor).post(generate_audio),
        )
        .route(
            "/books/:book/chapters/:chapter/audio/stream",
            get(stream_audio),
        )
        .route("/books/:book/chapters/:chapter/sync", post(auto_sync))
        .route("/books/:book/chapters/:chapter/trim", post(trim_audio))
        .route("/books/:book/chapters/:chapter/restore", post(restore_audio))
        .route(
            "/books/:book/chapters/:chapter/translate",
            post(translate_chapter),
        )
        .route("/books/:book/export", get(export_epub))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/events", get(job_events))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/voices", get(list_voices))
        .layer(DefaultBodyLimit::max(512 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until shutdown.
pub async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = build_state(config)?;
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, router(state))
        .await
        .map_err(Error::Io)
}

// ============================================================================
// Error mapping
// ============================================================================

pub struct ApiError {
    status: StatusCode,
    reason: String,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MalformedContainer(_)
            | Error::UnsupportedPackage(_)
            | Error::InvalidRange(_)
            | Error::UnknownVoice(_) => StatusCode::BAD_REQUEST,
            Error::AlignmentDiverged { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Canceled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            reason: e.reason().to_string(),
            message: e.to_string(),
        }
    }
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            reason: "bad_request".into(),
            message: message.into(),
        }
    }

    /// Failure of an awaited job, typed by the reason on its final event.
    fn from_job(job: &Job) -> Self {
        let reason = match job.progress.snapshot() {
            Some(ProgressEvent::Error { reason, .. }) => reason,
            _ => "internal".to_string(),
        };
        let status = match reason.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "malformed_container" | "unsupported_package" | "asset_missing" | "invalid_range"
            | "unknown_voice" => StatusCode::BAD_REQUEST,
            "alignment_diverged" => StatusCode::UNPROCESSABLE_ENTITY,
            "canceled" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            reason,
            message: job.error().unwrap_or_else(|| "job failed".into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "reason": self.reason })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Request/response shapes
// ============================================================================

#[derive(Deserialize)]
struct LangQuery {
    lang: Option<String>,
}

#[derive(Serialize)]
struct ChapterHtmlResponse {
    html: String,
    chapter: ChapterMeta,
}

#[derive(Serialize)]
struct AudioDescriptorResponse {
    url: String,
    duration: f64,
    source: crate::book::AudioSourceKind,
}

#[derive(Deserialize)]
struct GenerateRequest {
    voice: String,
    lang: Option<String>,
    #[serde(default)]
    use_translation: bool,
}

#[derive(Deserialize)]
struct SyncRequest {
    mode: AlignMode,
    engine: Option<String>,
    lang: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrimRequest {
    Range { trim_start: f64, trim_end: f64 },
    Skip { skip_word_ids: Vec<String> },
}

#[derive(Serialize)]
struct TrimResponse {
    duration: f64,
    sync_table: SyncTable,
}

#[derive(Serialize)]
struct DurationResponse {
    duration: f64,
}

#[derive(Serialize)]
struct JobIdResponse {
    job_id: Uuid,
}

#[derive(Deserialize)]
struct TranslateRequest {
    target_lang: String,
}

// ============================================================================
// Books and chapters
// ============================================================================

async fn ingest(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<Book>> {
    let mut bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart body: {e}")))?
    {
        if field.file_name().is_some() || bytes.is_none() {
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("bad upload: {e}")))?
                    .to_vec(),
            );
        }
    }
    let bytes = bytes.ok_or_else(|| ApiError::bad_request("no EPUB file in request"))?;

    let book_id = Uuid::new_v4();
    let store = Arc::clone(&state.store);
    let prefix = state.config.asset_url_prefix.clone();
    let job = state.controller.submit(
        JobKind::Ingest,
        TargetKey::book_level(book_id.to_string(), OpClass::Source),
        None,
        "ingest",
        move |job| {
            job.progress
                .emit(ProgressEvent::progress("ingest", "unpacking and normalizing"));
            ingest_book(store.as_ref(), &prefix, book_id, &bytes).map(|_| ())
        },
    );

    if job.wait().await != crate::pipeline::JobState::Succeeded {
        return Err(ApiError::from_job(&job));
    }
    let book = state.meta.load(&book_id.to_string())?;
    Ok(Json(book))
}

async fn list_books(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Book>>> {
    Ok(Json(state.meta.list()?))
}

async fn get_book(
    State(state): State<Arc<AppState>>,
    Path(book): Path<String>,
) -> ApiResult<Json<Book>> {
    Ok(Json(state.meta.load(&book)?))
}

async fn remove_book(
    State(state): State<Arc<AppState>>,
    Path(book): Path<String>,
) -> ApiResult<StatusCode> {
    state.meta.delete(&book)?;
    info!(book = %book, "deleted book");
    Ok(StatusCode::NO_CONTENT)
}

async fn chapter_html(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Query(query): Query<LangQuery>,
) -> ApiResult<Json<ChapterHtmlResponse>> {
    let record = state.meta.load(&book)?;
    let meta = record
        .chapters
        .get(chapter)
        .ok_or_else(|| ApiError::from(Error::NotFound(format!("chapter {chapter}"))))?
        .clone();

    let rel = match &query.lang {
        Some(lang) if *lang != default_lang(&record) => paths::chapter_html_lang(chapter, lang),
        _ => paths::chapter_html(chapter),
    };
    let html = String::from_utf8_lossy(&state.store.get(&book, &rel)?).into_owned();
    Ok(Json(ChapterHtmlResponse {
        html,
        chapter: meta,
    }))
}

// ============================================================================
// Audio
// ============================================================================

async fn audio_descriptor(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Query(query): Query<LangQuery>,
) -> ApiResult<Json<AudioDescriptorResponse>> {
    let lang = resolve_lang(&state, &book, query.lang.as_deref())?;
    let artifact = state.sources.artifact(&book, chapter, &lang)?;
    Ok(Json(AudioDescriptorResponse {
        url: format!("/books/{book}/chapters/{chapter}/audio/stream?lang={lang}"),
        duration: artifact.duration,
        source: artifact.source,
    }))
}

async fn stream_audio(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Query(query): Query<LangQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let lang = resolve_lang(&state, &book, query.lang.as_deref())?;
    let artifact = state.sources.artifact(&book, chapter, &lang)?;
    let rel = paths::audio_canonical(&lang, chapter, artifact.format.extension());
    let bytes = state.store.get(&book, &rel)?;
    let total = bytes.len() as u64;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_byte_range(v, total));

    let response = match range {
        Some((start, end)) => {
            let body = bytes[start as usize..=end as usize].to_vec();
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, artifact.format.media_type().to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{total}"),
                    ),
                ],
                body,
            )
                .into_response()
        }
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, artifact.format.media_type().to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            bytes,
        )
            .into_response(),
    };
    Ok(response)
}

/// Parse a single-range `bytes=` header against a known length.
fn parse_byte_range(value: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let spec = value.strip_prefix("bytes=")?.split(',').next()?.trim();
    let (start, end) = spec.split_once('-')?;
    let range = match (start.is_empty(), end.is_empty()) {
        (false, false) => (start.parse().ok()?, end.parse().ok()?),
        (false, true) => (start.parse().ok()?, total - 1),
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            (total.saturating_sub(suffix), total - 1)
        }
        (true, true) => return None,
    };
    let (start, end) = range;
    let end = end.min(total - 1);
    (start <= end).then_some((start, end))
}

async fn generate_audio(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<JobIdResponse>> {
    state.catalog.check(&request.voice)?;
    let target_lang = voice_language(&request.voice);
    if let Some(lang) = &request.lang
        && *lang != target_lang
    {
        return Err(ApiError::bad_request(format!(
            "voice {} synthesizes {target_lang}, not {lang}",
            request.voice
        )));
    }

    let tokens: crate::book::TokenTable =
        load_json(state.store.as_ref(), &book, &paths::chapter_tokens(chapter))?;
    let mut fingerprint = fingerprint_tts(
        &book,
        chapter,
        &request.voice,
        &token_table_hash(&tokens),
    );
    if request.use_translation {
        fingerprint.push('t');
    }

    let sources = Arc::clone(&state.sources);
    let book_id = book.clone();
    let voice = request.voice.clone();
    let use_translation = request.use_translation;
    let job = state.controller.submit(
        JobKind::Tts,
        TargetKey::chapter_level(book, chapter, target_lang, OpClass::Source),
        Some(fingerprint),
        "tts",
        move |job| {
            job.progress.emit(ProgressEvent::progress_percent(
                "tts",
                "synthesizing chapter audio",
                10,
            ));
            let built = sources.synthesize(&book_id, chapter, &voice, use_translation, &job.cancel)?;
            job.progress.emit(ProgressEvent::done(
                "tts",
                format!("synthesized {:.1}s of audio", built.artifact.duration),
            ));
            Ok(())
        },
    );
    Ok(Json(JobIdResponse { job_id: job.id }))
}

// ============================================================================
// Alignment
// ============================================================================

async fn auto_sync(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<JobIdResponse>> {
    let lang = resolve_lang(&state, &book, request.lang.as_deref())?;

    // resolve backend and fingerprint from committed state
    let prep = {
        let state = Arc::clone(&state);
        let book = book.clone();
        let lang = lang.clone();
        let engine = request.engine.clone();
        let mode = request.mode;
        tokio::task::spawn_blocking(move || -> Result<(String, String)> {
            let artifact = state.sources.artifact(&book, chapter, &lang)?;
            let tokens = state.sources.tokens_for(&book, chapter, &lang)?;
            let audio = state.store.get(
                &book,
                &paths::audio_canonical(&lang, chapter, artifact.format.extension()),
            )?;

            let backend = match mode {
                AlignMode::Auto
                    if PassthroughAligner::eligible(
                        &artifact,
                        &tokens,
                        state.config.passthrough_coverage,
                    ) =>
                {
                    "passthrough".to_string()
                }
                _ => engine.unwrap_or_else(|| "dtw".to_string()),
            };
            let fingerprint =
                fingerprint_alignment(&sha1_hex(&audio), &token_table_hash(&tokens), &backend);
            Ok((backend, fingerprint))
        })
        .await
        .map_err(|e| ApiError::bad_request(format!("alignment prep failed: {e}")))??
    };
    let (backend_name, fingerprint) = prep;

    let sources = Arc::clone(&state.sources);
    let store = Arc::clone(&state.store);
    let tts = Arc::clone(&state.tts);
    let config = state.config.clone();
    let book_id = book.clone();
    let lang_key = lang.clone();
    let job = state.controller.submit(
        JobKind::Align,
        TargetKey::chapter_level(book, chapter, lang, OpClass::Align),
        Some(fingerprint),
        "align",
        move |job| {
            job.progress.emit(ProgressEvent::progress_percent(
                "align",
                format!("aligning with {backend_name}"),
                10,
            ));
            let artifact = sources.artifact(&book_id, chapter, &lang_key)?;
            let tokens = sources.tokens_for(&book_id, chapter, &lang_key)?;
            let ext = artifact.format.extension();
            let (_staging, audio_path) = sources.materialize(
                &book_id,
                &paths::audio_canonical(&lang_key, chapter, ext),
                ext,
            )?;

            let backend: Box<dyn AlignBackend> = match backend_name.as_str() {
                "passthrough" => Box::new(PassthroughAligner),
                "asr" => {
                    let command =
                        config.aligner_command.as_deref().ok_or_else(|| Error::BackendFailed {
                            backend: "aligner".into(),
                            message: "no asr aligner configured".into(),
                        })?;
                    Box::new(CommandAligner::new(command, config.align_timeout()))
                }
                _ => Box::new(DtwAligner::new(
                    Arc::clone(&tts),
                    artifact.voice.clone().unwrap_or_else(|| lang_key.clone()),
                )),
            };

            let table = crate::align::run(
                backend.as_ref(),
                &audio_path,
                &artifact,
                &tokens,
                config.min_alignment_coverage,
                &job.cancel,
            )?;
            save_json(
                store.as_ref(),
                &book_id,
                &paths::sync_table(&lang_key, chapter),
                &table,
            )?;
            job.progress.emit(ProgressEvent::done(
                "align",
                format!("{} of {} tokens timed", table.timed_count(), table.len()),
            ));
            Ok(())
        },
    );
    Ok(Json(JobIdResponse { job_id: job.id }))
}

// ============================================================================
// Edits
// ============================================================================

async fn trim_audio(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Query(query): Query<LangQuery>,
    Json(request): Json<TrimRequest>,
) -> ApiResult<Json<TrimResponse>> {
    let lang = resolve_lang(&state, &book, query.lang.as_deref())?;
    let key = TargetKey::chapter_level(book.clone(), chapter, lang.clone(), OpClass::Edit);
    let lock = state.controller.key_lock(&key);
    let _guard = lock.lock().await;

    let editor = Arc::clone(&state.editor);
    let outcome: EditOutcome = tokio::task::spawn_blocking(move || match request {
        TrimRequest::Range {
            trim_start,
            trim_end,
        } => editor.range_cut(
            &book,
            chapter,
            &lang,
            trim_start,
            trim_end,
            &Default::default(),
        ),
        TrimRequest::Skip { skip_word_ids } => {
            let ids: BTreeSet<String> = skip_word_ids.into_iter().collect();
            editor.skip_cut(&book, chapter, &lang, &ids, &Default::default())
        }
    })
    .await
    .map_err(|e| ApiError::bad_request(format!("edit worker failed: {e}")))??;

    Ok(Json(TrimResponse {
        duration: outcome.duration,
        sync_table: outcome.sync_table,
    }))
}

async fn restore_audio(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Query(query): Query<LangQuery>,
) -> ApiResult<Json<DurationResponse>> {
    let lang = resolve_lang(&state, &book, query.lang.as_deref())?;
    let key = TargetKey::chapter_level(book.clone(), chapter, lang.clone(), OpClass::Edit);
    let lock = state.controller.key_lock(&key);
    let _guard = lock.lock().await;

    let sources = Arc::clone(&state.sources);
    let duration = tokio::task::spawn_blocking(move || sources.restore(&book, chapter, &lang))
        .await
        .map_err(|e| ApiError::bad_request(format!("restore worker failed: {e}")))??;
    Ok(Json(DurationResponse { duration }))
}

// ============================================================================
// Translation
// ============================================================================

async fn translate_chapter(
    State(state): State<Arc<AppState>>,
    Path((book, chapter)): Path<(String, usize)>,
    Json(request): Json<TranslateRequest>,
) -> ApiResult<Json<JobIdResponse>> {
    let record = state.meta.load(&book)?;
    let source_lang = default_lang(&record);
    let target_lang = voice_language(&request.target_lang);
    if target_lang.is_empty() {
        return Err(ApiError::bad_request("empty target_lang"));
    }

    let tokens: crate::book::TokenTable =
        load_json(state.store.as_ref(), &book, &paths::chapter_tokens(chapter))?;
    let fingerprint =
        fingerprint_translation(&book, chapter, &target_lang, &token_table_hash(&tokens));

    let sources = Arc::clone(&state.sources);
    let store = Arc::clone(&state.store);
    let book_id = book.clone();
    let target = target_lang.clone();
    let job = state.controller.submit(
        JobKind::TranslateChapter,
        TargetKey::chapter_level(book, chapter, target_lang, OpClass::Source),
        Some(fingerprint),
        "translate",
        move |job| {
            job.progress.emit(ProgressEvent::progress_percent(
                "translate",
                format!("translating to {target}"),
                20,
            ));
            let translated =
                sources.translate_chapter(&book_id, chapter, &source_lang, &target, &job.cancel)?;
            let html = render_plain_tokens(&translated);
            store.put(
                &book_id,
                &paths::chapter_html_lang(chapter, &target),
                html.as_bytes(),
            )?;
            job.progress.emit(ProgressEvent::Done {
                step: "translate".into(),
                message: html,
            });
            Ok(())
        },
    );
    Ok(Json(JobIdResponse { job_id: job.id }))
}

// ============================================================================
// Export
// ============================================================================

async fn export_epub(
    State(state): State<Arc<AppState>>,
    Path(book): Path<String>,
) -> ApiResult<Response> {
    let key = TargetKey::book_level(book.clone(), OpClass::Export);
    let lock = state.controller.key_lock(&key);
    let _guard = lock.lock().await;

    let store = Arc::clone(&state.store);
    let prefix = state.config.asset_url_prefix.clone();
    let exported =
        tokio::task::spawn_blocking(move || export_book(store.as_ref(), &book, &prefix))
            .await
            .map_err(|e| ApiError::bad_request(format!("export worker failed: {e}")))??;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/epub+zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", exported.filename),
            ),
        ],
        exported.bytes,
    )
        .into_response())
}

// ============================================================================
// Jobs and voices
// ============================================================================

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<crate::pipeline::JobRecord>> {
    let job = state
        .controller
        .job(id)
        .ok_or_else(|| ApiError::from(Error::NotFound(format!("job {id}"))))?;
    Ok(Json(job.record()))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.controller.job(id).is_none() {
        return Err(ApiError::from(Error::NotFound(format!("job {id}"))));
    }
    let canceled = state.controller.cancel(id);
    Ok(Json(json!({ "canceled": canceled })))
}

async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>>>
{
    let job = state
        .controller
        .job(id)
        .ok_or_else(|| ApiError::from(Error::NotFound(format!("job {id}"))))?;

    let (snapshot, mut rx) = job.progress.subscribe();
    let (tx, out) = tokio::sync::mpsc::channel::<ProgressEvent>(64);
    tokio::spawn(async move {
        if let Some(event) = snapshot {
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() || terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });

    let stream = ReceiverStream::new(out).map(|event| {
        Ok(SseEvent::default()
            .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".into())))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_voices(State(state): State<Arc<AppState>>) -> Json<Vec<Voice>> {
    Json(state.catalog.voices().to_vec())
}

// ============================================================================
// Helpers
// ============================================================================

fn default_lang(book: &Book) -> String {
    match voice_language(&book.metadata.language).as_str() {
        "" => "en".to_string(),
        prefix => prefix.to_string(),
    }
}

/// Explicit `lang` query parameter, else the book's own language prefix.
fn resolve_lang(state: &AppState, book: &str, lang: Option<&str>) -> Result<String> {
    match lang {
        Some(lang) if !lang.is_empty() => Ok(lang.to_ascii_lowercase()),
        _ => {
            let record = state.meta.load(book)?;
            Ok(default_lang(&record))
        }
    }
}
