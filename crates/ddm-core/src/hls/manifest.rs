//! Per-task manifest (§4.5, §6): segment count, completion bitmap,
//! per-segment decryption descriptors and checksums, rewritten atomically
//! (write-temp, rename) on every segment completion — the same idiom
//! `storage::StorageWriter::finalize` uses for the final output file.
//!
//! Absence or corruption of the manifest forces a restart from segment 0
//! (§6): `Manifest::load` returns `None` for either case rather than an
//! error, and the caller treats a missing manifest as "nothing completed
//! yet".

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::segmenter::SegmentBitmap;

/// Ambient per-segment metadata captured at playlist-parse time so a resumed
/// job can re-derive decryption parameters without re-parsing the playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSegment {
    pub uri: String,
    pub duration: f64,
    pub discontinuity: bool,
    pub key_uri: Option<String>,
    /// Explicit IV, hex-encoded, when the playlist declared one.
    pub iv_hex: Option<String>,
    /// SHA-256 of the decrypted segment, recorded once the segment
    /// completes (§3's "sequence checksums").
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u8,
    pub source_url: String,
    pub segment_count: usize,
    pub completed_bitmap: Vec<u8>,
    pub segments: Vec<ManifestSegment>,
}

const MANIFEST_VERSION: u8 = 1;

impl Manifest {
    pub fn new(source_url: impl Into<String>, segments: Vec<ManifestSegment>) -> Self {
        let segment_count = segments.len();
        Self {
            version: MANIFEST_VERSION,
            source_url: source_url.into(),
            segment_count,
            completed_bitmap: SegmentBitmap::new(segment_count).to_bytes(segment_count),
            segments,
        }
    }

    pub fn bitmap(&self) -> SegmentBitmap {
        SegmentBitmap::from_bytes(&self.completed_bitmap, self.segment_count)
    }

    pub fn set_bitmap(&mut self, bitmap: &SegmentBitmap) {
        self.completed_bitmap = bitmap.to_bytes(self.segment_count);
    }

    pub fn mark_complete(&mut self, index: usize, sha256: Option<String>) {
        let mut bitmap = self.bitmap();
        bitmap.set_completed(index);
        self.set_bitmap(&bitmap);
        if let Some(seg) = self.segments.get_mut(index) {
            seg.sha256 = sha256;
        }
    }

    /// Load an existing manifest from `path`. Any I/O or parse failure is
    /// treated as "no manifest" (§6) rather than propagated.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Write-temp-then-rename so a crash mid-write never leaves a partially
    /// written manifest behind to be misread as valid on the next run.
    pub fn save_atomic(&self, path: &Path) -> std::io::Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);
        let data = serde_json::to_vec_pretty(self).expect("manifest is always serializable");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Standard manifest filename within a task's scratch directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Path to segment `index`'s reserved scratch file: `scratch/NNN.part`.
pub fn segment_part_path(scratch_dir: &Path, index: usize) -> std::path::PathBuf {
    scratch_dir.join(format!("{index:05}.part"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(uri: &str) -> ManifestSegment {
        ManifestSegment {
            uri: uri.to_string(),
            duration: 6.0,
            discontinuity: false,
            key_uri: None,
            iv_hex: None,
            sha256: None,
        }
    }

    #[test]
    fn round_trips_through_atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);

        let mut manifest = Manifest::new("https://h/playlist.m3u8", vec![seg("s0.ts"), seg("s1.ts")]);
        manifest.mark_complete(0, Some("deadbeef".to_string()));
        manifest.save_atomic(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.segment_count, 2);
        assert!(loaded.bitmap().is_completed(0));
        assert!(!loaded.bitmap().is_completed(1));
        assert_eq!(loaded.segments[0].sha256.as_deref(), Some("deadbeef"));
        // No stray temp file left behind after the rename.
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn missing_manifest_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(&dir.path().join(MANIFEST_FILENAME)).is_none());
    }

    #[test]
    fn corrupt_manifest_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILENAME);
        std::fs::write(&path, b"not json").unwrap();
        assert!(Manifest::load(&path).is_none());
    }

    #[test]
    fn segment_part_path_is_zero_padded() {
        let dir = Path::new("/scratch/task-1");
        assert_eq!(segment_part_path(dir, 7), dir.join("00007.part"));
    }
}
