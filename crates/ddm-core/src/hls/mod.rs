//! HLS playlist parsing, key fetch/cache, AES-128-CBC segment decryption,
//! resumable manifest persistence and the segment executor that ties them
//! together into a running download (§4.1, §4.5).

mod decrypt;
mod fetch;
mod job;
mod key_cache;
mod manifest;
mod playlist;

pub use decrypt::{decrypt_segment, derive_iv_from_sequence, parse_iv_hex, resolve_iv};
pub use fetch::{classify_http_error, classify_transport_error, fetch_bytes, fetch_key};
pub use job::{
    run_segment_executor, ExecutorContext, ExecutorError, HlsJobSpec, JobControlToken, JobOutcome,
};
pub use key_cache::KeyCache;
pub use manifest::{segment_part_path, Manifest, ManifestSegment, MANIFEST_FILENAME};
pub use playlist::{
    extract_m3u8_url_from_page, extract_url_pattern, parse_master_playlist, parse_media_playlist,
    select_best_quality, select_lowest_quality, EncryptionDescriptor, M3U8Segment, M3U8Stream,
};
