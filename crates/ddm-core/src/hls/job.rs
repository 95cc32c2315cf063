//! SegmentExecutor (§4.5): the orchestrator that turns a playlist URL into a
//! resumable, pausable, cancelable download, wiring together every other
//! `hls` building block plus the connection pool, per-category retry table,
//! circuit breaker registry and task state machine.
//!
//! Segments are fetched concurrently (bounded by `per_task_parallelism`) but
//! each lands in its own `scratch/NNN.part` file; final assembly is a
//! strictly-ordered concatenation, following `storage::writer`'s
//! write-temp-then-rename idiom one level up (concat-then-rename rather than
//! offset writes, since HLS segments are independent files, not slices of
//! one larger resource).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::connection_pool::ConnectionPool;
use crate::eta::ProgressSample;
use crate::host_policy::{CircuitBreakerRegistry, HostKey};
use crate::retry::{CategoryPolicyTable, RetryDecision};
use crate::task::{TaskState, TaskStateMachine};

use super::decrypt::{decrypt_segment, resolve_iv};
use super::fetch::fetch_bytes as fetch_bytes_blocking;
use super::fetch::fetch_key as fetch_key_blocking;
use super::key_cache::KeyCache;
use super::manifest::{segment_part_path, Manifest, ManifestSegment, MANIFEST_FILENAME};
use super::playlist::{
    extract_m3u8_url_from_page, parse_master_playlist, parse_media_playlist, select_best_quality,
    M3U8Segment,
};
use crate::error::DomainError;

/// Cooperative pause/cancel signal for one running job, mirroring
/// `control::JobControl`'s shared-atomic-bool pattern but distinguishing
/// "finish the in-flight segment then stop" (pause) from "stop touching the
/// output at all" (cancel), since §4.5 gives the two different cleanup paths.
#[derive(Clone, Default)]
pub struct JobControlToken {
    pause: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl JobControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Parameters for one HLS download.
#[derive(Debug, Clone)]
pub struct HlsJobSpec {
    pub task_id: i64,
    pub source_url: String,
    pub output_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub per_task_parallelism: usize,
}

/// Result of a completed `run_segment_executor` call.
#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        bytes_written: u64,
        segments_completed: usize,
    },
    Paused {
        segments_completed: usize,
    },
    Canceled,
}

/// Failure reasons specific to the segment executor (§4.5's edge cases),
/// beyond the ordinary `DomainError` a segment fetch can raise.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("playlist now has {new} segments, fewer than the {recorded} already recorded")]
    PlaylistShrunk { recorded: usize, new: usize },
    #[error("segment {index} failed: {source}")]
    SegmentDownloadError { index: usize, source: DomainError },
    #[error("failed to assemble final output: {0}")]
    AssemblyError(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Shared, process-wide machinery the executor consults on every segment.
pub struct ExecutorContext {
    pub connection_pool: Arc<ConnectionPool>,
    pub circuit_breakers: Arc<Mutex<CircuitBreakerRegistry>>,
    pub retry_policies: CategoryPolicyTable,
    pub key_cache: Arc<KeyCache>,
    pub state_machine: Arc<TaskStateMachine>,
}

/// Fetch `url`'s body, blocking. Wrapped in `spawn_blocking` by every caller
/// in this module, matching `scheduler::execute::invoke`'s treatment of
/// `curl::easy::Easy` as synchronous I/O that must not run on the async
/// executor's own thread.
fn fetch_text_blocking(url: &str) -> Result<String, DomainError> {
    let bytes = fetch_bytes_blocking(url, &std::collections::HashMap::new())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Parse `text` (fetched from `url`) as either a master or media playlist,
/// falling back to one page-scrape-and-recurse attempt per §4.1.
async fn resolve_media_segments(url: &str, text: &str) -> Result<Vec<M3U8Segment>, ExecutorError> {
    if let Ok(streams) = parse_master_playlist(text, url) {
        let best = select_best_quality(&streams)
            .expect("parse_master_playlist never returns an empty stream list");
        let variant_url = best.uri.clone();
        let variant_text =
            tokio::task::spawn_blocking(move || fetch_text_blocking(&variant_url))
                .await
                .expect("blocking fetch task panicked")?;
        return Ok(parse_media_playlist(&variant_text, &best.uri)?);
    }

    if let Ok(segments) = parse_media_playlist(text, url) {
        return Ok(segments);
    }

    let scraped = extract_m3u8_url_from_page(text).ok_or_else(|| {
        ExecutorError::Domain(DomainError::PlaylistParse(
            "neither a master nor a media playlist, and no .m3u8 URL found on the page".to_string(),
        ))
    })?;
    let scraped_text = {
        let url = scraped.clone();
        tokio::task::spawn_blocking(move || fetch_text_blocking(&url))
            .await
            .expect("blocking fetch task panicked")?
    };
    if let Ok(streams) = parse_master_playlist(&scraped_text, &scraped) {
        let best = select_best_quality(&streams)
            .expect("parse_master_playlist never returns an empty stream list");
        let variant_url = best.uri.clone();
        let variant_text =
            tokio::task::spawn_blocking(move || fetch_text_blocking(&variant_url))
                .await
                .expect("blocking fetch task panicked")?;
        return Ok(parse_media_playlist(&variant_text, &best.uri)?);
    }
    Ok(parse_media_playlist(&scraped_text, &scraped)?)
}

/// Resolve and cache the AES-128 key for every distinct `EXT-X-KEY` URI the
/// playlist references, so no per-segment worker ever blocks on a cold key
/// fetch after dispatch begins.
async fn prefetch_keys(
    segments: &[M3U8Segment],
    ctx: &ExecutorContext,
) -> Result<(), ExecutorError> {
    let mut seen = std::collections::HashSet::new();
    for segment in segments {
        let Some(key_desc) = &segment.key else { continue };
        if !seen.insert(key_desc.uri.clone()) {
            continue;
        }
        if ctx.key_cache.get(&key_desc.uri).is_some() {
            continue;
        }

        let host = HostKey::from_url(&key_desc.uri)
            .map_err(|e| ExecutorError::Domain(DomainError::InvalidUrl(e.to_string())))?;
        let mut attempt = 1u32;
        loop {
            if !ctx.circuit_breakers.lock().unwrap().allow_request(&host, crate::error::ErrorCategory::Encryption) {
                return Err(ExecutorError::Domain(DomainError::CircuitOpen));
            }
            let _lease = ctx.connection_pool.checkout(host.clone()).await?;
            let uri = key_desc.uri.clone();
            let result = tokio::task::spawn_blocking(move || fetch_key_blocking(&uri))
                .await
                .expect("blocking key fetch panicked");

            match result {
                Ok(key_bytes) => {
                    ctx.circuit_breakers
                        .lock()
                        .unwrap()
                        .record_success(&host, crate::error::ErrorCategory::Encryption);
                    ctx.key_cache.insert(key_desc.uri.clone(), key_bytes);
                    break;
                }
                Err(err) => {
                    let category = err.category();
                    ctx.circuit_breakers.lock().unwrap().record_failure(&host, category);
                    match ctx.retry_policies.decide(category, attempt, None) {
                        RetryDecision::RetryAfter(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::NoRetry => return Err(err.into()),
                    }
                }
            }
        }
    }
    Ok(())
}

fn manifest_segments_from_playlist(segments: &[M3U8Segment]) -> Vec<ManifestSegment> {
    segments
        .iter()
        .map(|s| ManifestSegment {
            uri: s.uri.clone(),
            duration: s.duration,
            discontinuity: s.discontinuity,
            key_uri: s.key.as_ref().map(|k| k.uri.clone()),
            iv_hex: s.key.as_ref().and_then(|k| k.iv.clone()),
            sha256: None,
        })
        .collect()
}

/// Fetch, decrypt and persist one segment to `scratch/NNN.part`. Returns the
/// decrypted byte count and its SHA-256 hex digest.
async fn run_one_segment(
    index: usize,
    segment: M3U8Segment,
    is_terminal: bool,
    scratch_dir: PathBuf,
    ctx: Arc<ExecutorContext>,
) -> Result<(u64, String), ExecutorError> {
    let host = HostKey::from_url(&segment.uri)
        .map_err(|e| ExecutorError::Domain(DomainError::InvalidUrl(e.to_string())))?;

    let mut attempt = 1u32;
    let ciphertext = loop {
        if !ctx
            .circuit_breakers
            .lock()
            .unwrap()
            .allow_request(&host, crate::error::ErrorCategory::Network)
        {
            return Err(ExecutorError::SegmentDownloadError {
                index,
                source: DomainError::CircuitOpen,
            });
        }

        // Blocks (awaits) until a per-host and global slot is free (§4.2/§5)
        // rather than failing the segment on transient pool pressure.
        let lease = ctx
            .connection_pool
            .checkout(host.clone())
            .await
            .map_err(|source| ExecutorError::SegmentDownloadError { index, source })?;

        let uri = segment.uri.clone();
        let result = tokio::task::spawn_blocking(move || {
            fetch_bytes_blocking(&uri, &std::collections::HashMap::new())
        })
        .await
        .expect("blocking segment fetch panicked");
        drop(lease);

        match result {
            Ok(bytes) => {
                ctx.circuit_breakers
                    .lock()
                    .unwrap()
                    .record_success(&host, crate::error::ErrorCategory::Network);
                break bytes;
            }
            Err(err) => {
                let category = err.category();
                ctx.circuit_breakers.lock().unwrap().record_failure(&host, category);
                match ctx.retry_policies.decide(category, attempt, None) {
                    RetryDecision::RetryAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::NoRetry => {
                        return Err(ExecutorError::SegmentDownloadError { index, source: err })
                    }
                }
            }
        }
    };

    let plaintext = match &segment.key {
        Some(key_desc) => {
            let key = ctx
                .key_cache
                .get(&key_desc.uri)
                .expect("key was prefetched for every distinct EXT-X-KEY URI before dispatch");
            let iv = resolve_iv(key_desc.iv.as_deref(), segment.media_sequence)
                .map_err(|source| ExecutorError::SegmentDownloadError { index, source })?;
            decrypt_segment(&ciphertext, &key, &iv, is_terminal)
                .map_err(|source| ExecutorError::SegmentDownloadError { index, source })?
        }
        None => ciphertext,
    };

    let sha256 = hex::encode(Sha256::digest(&plaintext));
    let len = plaintext.len() as u64;
    let part_path = segment_part_path(&scratch_dir, index);
    tokio::fs::write(&part_path, &plaintext)
        .await
        .map_err(|e| ExecutorError::SegmentDownloadError {
            index,
            source: DomainError::FilesystemGeneric(e.to_string()),
        })?;

    Ok((len, sha256))
}

/// Concatenate every segment's `.part` file, in index order, into
/// `output_path`.
async fn assemble_output(
    scratch_dir: &Path,
    output_path: &Path,
    segment_count: usize,
) -> Result<u64, ExecutorError> {
    use tokio::io::AsyncWriteExt;

    let mut out = tokio::fs::File::create(output_path)
        .await
        .map_err(|e| ExecutorError::AssemblyError(e.to_string()))?;
    let mut total = 0u64;
    for index in 0..segment_count {
        let part_path = segment_part_path(scratch_dir, index);
        let bytes = tokio::fs::read(&part_path)
            .await
            .map_err(|e| ExecutorError::AssemblyError(format!("{}: {e}", part_path.display())))?;
        out.write_all(&bytes)
            .await
            .map_err(|e| ExecutorError::AssemblyError(e.to_string()))?;
        total += bytes.len() as u64;
    }
    out.sync_all()
        .await
        .map_err(|e| ExecutorError::AssemblyError(e.to_string()))?;
    Ok(total)
}

/// Run a complete HLS download: parse, resume-or-create the manifest,
/// dispatch segment workers up to `per_task_parallelism` at a time, and
/// assemble the final file once every segment is complete.
///
/// `progress_tx`, if set, receives one `ProgressSample` per completed
/// segment so a caller can feed `eta::EtaCalculator`.
pub async fn run_segment_executor(
    spec: HlsJobSpec,
    ctx: Arc<ExecutorContext>,
    control: JobControlToken,
    progress_tx: Option<mpsc::Sender<ProgressSample>>,
) -> Result<JobOutcome, ExecutorError> {
    tokio::fs::create_dir_all(&spec.scratch_dir)
        .await
        .map_err(|e| ExecutorError::Domain(DomainError::FilesystemGeneric(e.to_string())))?;

    let playlist_text = {
        let url = spec.source_url.clone();
        tokio::task::spawn_blocking(move || fetch_text_blocking(&url))
            .await
            .expect("blocking playlist fetch panicked")?
    };
    let segments = resolve_media_segments(&spec.source_url, &playlist_text).await?;

    let manifest_path = spec.scratch_dir.join(MANIFEST_FILENAME);
    let mut manifest = match Manifest::load(&manifest_path) {
        Some(existing) if existing.segment_count > segments.len() => {
            return Err(ExecutorError::PlaylistShrunk {
                recorded: existing.segment_count,
                new: segments.len(),
            });
        }
        Some(mut existing) => {
            let bitmap = existing.bitmap();
            existing.segments = manifest_segments_from_playlist(&segments);
            existing.segment_count = segments.len();
            existing.set_bitmap(&bitmap);
            existing
        }
        None => Manifest::new(spec.source_url.clone(), manifest_segments_from_playlist(&segments)),
    };
    manifest.save_atomic(&manifest_path).map_err(|e| {
        ExecutorError::Domain(DomainError::FilesystemGeneric(e.to_string()))
    })?;

    prefetch_keys(&segments, &ctx).await?;

    ctx.state_machine.register(spec.task_id);
    let current = ctx
        .state_machine
        .status(spec.task_id)
        .map(|s| s.state)
        .unwrap_or(TaskState::Preparing);
    let _ = ctx
        .state_machine
        .transition(spec.task_id, TaskState::Running, current != TaskState::Running);

    let bitmap = manifest.bitmap();
    let pending: Vec<usize> = (0..segments.len()).filter(|i| !bitmap.is_completed(*i)).collect();
    let last_index = segments.len().saturating_sub(1);

    let manifest = Arc::new(tokio::sync::Mutex::new(manifest));
    let parallelism = spec.per_task_parallelism.max(1);
    let mut join_set = tokio::task::JoinSet::new();
    let mut bytes_written = 0u64;
    let mut segments_completed = segments.len() - pending.len();
    let mut dispatch_cursor = 0usize;

    loop {
        while dispatch_cursor < pending.len()
            && join_set.len() < parallelism
            && !control.is_pause_requested()
            && !control.is_cancel_requested()
        {
            let index = pending[dispatch_cursor];
            dispatch_cursor += 1;
            let segment = segments[index].clone();
            let is_terminal = index == last_index;
            let scratch_dir = spec.scratch_dir.clone();
            let ctx = Arc::clone(&ctx);
            join_set.spawn(async move {
                let result = run_one_segment(index, segment, is_terminal, scratch_dir, ctx).await;
                (index, result)
            });
        }

        if join_set.is_empty() {
            break;
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (index, result) = joined.expect("segment worker task panicked");
        let (len, sha256) = result?;
        bytes_written += len;
        segments_completed += 1;

        {
            let mut m = manifest.lock().await;
            m.mark_complete(index, Some(sha256));
            m.save_atomic(&manifest_path).map_err(|e| {
                ExecutorError::Domain(DomainError::FilesystemGeneric(e.to_string()))
            })?;
        }

        if let Some(tx) = &progress_tx {
            let _ = tx
                .send(ProgressSample {
                    at: std::time::Instant::now(),
                    bytes_done: bytes_written,
                })
                .await;
        }

        if control.is_cancel_requested() {
            break;
        }
    }

    if control.is_cancel_requested() {
        let _ = ctx
            .state_machine
            .transition(spec.task_id, TaskState::Canceling, true);
        let _ = tokio::fs::remove_dir_all(&spec.scratch_dir).await;
        let _ = ctx
            .state_machine
            .transition(spec.task_id, TaskState::CleaningUp, true);
        let _ = ctx.state_machine.transition(spec.task_id, TaskState::Canceled, true);
        return Ok(JobOutcome::Canceled);
    }

    if segments_completed < segments.len() {
        // Dispatch halted for pause before every segment was fetched;
        // in-flight workers have already drained out of `join_set` above.
        let _ = ctx
            .state_machine
            .transition(spec.task_id, TaskState::Pausing, true);
        let _ = ctx.state_machine.transition(spec.task_id, TaskState::Paused, true);
        return Ok(JobOutcome::Paused { segments_completed });
    }

    let total_bytes = assemble_output(&spec.scratch_dir, &spec.output_path, segments.len())
        .await
        .map_err(|e| {
            let _ = ctx.state_machine.transition(spec.task_id, TaskState::Failed, true);
            e
        })?;
    let _ = tokio::fs::remove_dir_all(&spec.scratch_dir).await;
    let _ = ctx.state_machine.transition(spec.task_id, TaskState::Completed, false);

    Ok(JobOutcome::Completed {
        bytes_written: total_bytes,
        segments_completed,
    })
}
