//! Whole-body HTTP GET, shared by segment and key fetching.
//!
//! Adapted from `downloader::segment::download_one_segment`: same
//! low-speed-timeout/write-callback shape, but GETs the entire body into
//! memory (keys) or to a per-segment temp file (segments) rather than a
//! `Range` GET into a shared-file offset, since HLS segments are independent
//! files, not slices of one larger resource.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DomainError, ErrorCategory};
use crate::retry::{classify_curl_error, classify_http_status, ErrorKind};

/// Map a transport-level failure onto the error taxonomy so the retry
/// engine and circuit breaker can classify it without re-deriving the kind.
pub fn classify_transport_error(err: &curl::Error) -> DomainError {
    match classify_curl_error(err) {
        ErrorKind::Timeout => DomainError::ConnectionTimeout,
        ErrorKind::Connection => DomainError::NetworkGeneric(err.to_string()),
        ErrorKind::Throttled => DomainError::RateLimit { retry_after_secs: None },
        ErrorKind::Http5xx(code) => DomainError::Http5xx { status: code },
        ErrorKind::Other => DomainError::NetworkGeneric(err.to_string()),
    }
}

pub fn classify_http_error(status: u32) -> DomainError {
    match classify_http_status(status) {
        ErrorKind::Throttled => DomainError::RateLimit { retry_after_secs: None },
        ErrorKind::Http5xx(code) => DomainError::Http5xx { status: code },
        _ if (400..500).contains(&status) => DomainError::Http4xx { status: status as u16 },
        _ => DomainError::NetworkGeneric(format!("unexpected HTTP status {status}")),
    }
}

pub const NETWORK_CATEGORY: ErrorCategory = ErrorCategory::Network;

/// GET `url` into memory in full, applying the same low-speed/hard timeout
/// discipline as range segment fetches.
pub fn fetch_bytes(url: &str, custom_headers: &HashMap<String, String>) -> Result<Vec<u8>, DomainError> {
    let body: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let body_cb = Arc::clone(&body);

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(|e| classify_transport_error(&e))?;
    easy.follow_location(true).map_err(|e| classify_transport_error(&e))?;
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(|e| classify_transport_error(&e))?;
    easy.low_speed_limit(1024).map_err(|e| classify_transport_error(&e))?;
    easy.low_speed_time(Duration::from_secs(60))
        .map_err(|e| classify_transport_error(&e))?;
    easy.timeout(Duration::from_secs(3600))
        .map_err(|e| classify_transport_error(&e))?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(|e| classify_transport_error(&e))?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list).map_err(|e| classify_transport_error(&e))?;
    }

    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                body_cb.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            })
            .map_err(|e| classify_transport_error(&e))?;
        transfer.perform().map_err(|e| classify_transport_error(&e))?;
    }

    let code = easy.response_code().map_err(|e| classify_transport_error(&e))?;
    if !(200..300).contains(&code) {
        return Err(classify_http_error(code));
    }

    Ok(Arc::try_unwrap(body)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default())
}

/// Fetch a 16-byte AES-128 key from `uri`.
pub fn fetch_key(uri: &str) -> Result<[u8; 16], DomainError> {
    let bytes = fetch_bytes(uri, &HashMap::new())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DomainError::KeyFetch {
            url: uri.to_string(),
            reason: format!("expected 16-byte key, got {} bytes", bytes.len()),
        })
}
