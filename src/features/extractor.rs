//! Capture → feature vector, with a per-path cache and tracked split directories.

use super::stats::CaptureStats;
use super::{port_index, FeatureVector, Splitter, PORT_TABLE};
use crate::capture::CaptureReader;
use crate::error::{ConfigurationError, TestbedError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Parameters of [`FeatureExtractor::deep_extract`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepExtractOptions {
    pub split: bool,
    pub by_flow: bool,
    /// 0 = unlimited
    pub file_limit: usize,
    /// 0 = unlimited
    pub packet_limit: usize,
}

impl From<&crate::config::FeaturesConfig> for DeepExtractOptions {
    fn from(c: &crate::config::FeaturesConfig) -> Self {
        Self {
            split: c.split,
            by_flow: c.by_flow,
            file_limit: c.file_limit,
            packet_limit: c.packet_limit,
        }
    }
}

/// Owns the feature cache and every split directory it created.
#[derive(Debug)]
pub struct FeatureExtractor {
    ports: HashMap<u16, usize>,
    splitter: Splitter,
    features: BTreeMap<PathBuf, Arc<FeatureVector>>,
    directories: Vec<PathBuf>,
}

impl FeatureExtractor {
    pub fn new(splitter: Splitter) -> Result<Self, ConfigurationError> {
        Ok(Self {
            ports: port_index(&PORT_TABLE)?,
            splitter,
            features: BTreeMap::new(),
            directories: Vec::new(),
        })
    }

    /// Features of one capture. A path seen before returns the cached vector.
    pub fn extract(
        &mut self,
        path: &Path,
        packet_limit: usize,
    ) -> Result<Arc<FeatureVector>, TestbedError> {
        if let Some(fv) = self.features.get(path) {
            return Ok(Arc::clone(fv));
        }

        let mut reader = CaptureReader::open(path)?;
        let mut stats = CaptureStats::default();
        while let Some(packet) = reader.next_packet()? {
            stats.observe(&packet, &self.ports);
            if packet_limit != 0 && stats.packet_count() >= packet_limit as u64 {
                break;
            }
        }
        let fv = Arc::new(stats.finish());
        tracing::debug!(capture = %path.display(), packets = fv.packet_count(), "extracted");
        self.features.insert(path.to_path_buf(), Arc::clone(&fv));
        Ok(fv)
    }

    /// Split (or copy) `path` into `<stem>_processed` and extract every sub-capture.
    /// Returns the sub-captures in the order they were extracted.
    pub fn deep_extract(
        &mut self,
        path: &Path,
        options: DeepExtractOptions,
    ) -> Result<Vec<PathBuf>, TestbedError> {
        let dir = processed_dir(path);
        if self.directories.contains(&dir) || dir.exists() {
            return Err(ConfigurationError::DuplicateSplitDirectory {
                capture: path.to_path_buf(),
                directory: dir,
            }
            .into());
        }

        std::fs::create_dir_all(&dir).map_err(|e| TestbedError::io(&dir, e))?;
        self.directories.push(dir.clone());

        if options.split {
            self.splitter
                .split(path, &dir, options.by_flow, options.file_limit)?;
        } else {
            let file_name = path.file_name().unwrap_or(path.as_os_str());
            let target = dir.join(file_name);
            std::fs::copy(path, &target).map_err(|e| TestbedError::io(&target, e))?;
        }

        let mut captures: Vec<PathBuf> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "pcap"))
            .collect();
        captures.sort();

        for capture in &captures {
            self.extract(capture, options.packet_limit)?;
        }
        tracing::info!(
            capture = %path.display(),
            directory = %dir.display(),
            files = captures.len(),
            "deep extraction done"
        );
        Ok(captures)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<FeatureVector>> {
        self.features.get(path).cloned()
    }

    /// Every cached vector, keyed and ordered by path.
    pub fn all(&self) -> BTreeMap<PathBuf, Arc<FeatureVector>> {
        self.features.clone()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.features.keys().map(PathBuf::as_path)
    }

    /// Split directories created so far.
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Remove every tracked split directory. Failures are logged and returned.
    pub fn split_clean(&mut self) -> Vec<(PathBuf, std::io::Error)> {
        let mut failures = Vec::new();
        for dir in self.directories.drain(..) {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => tracing::debug!(directory = %dir.display(), "removed split directory"),
                Err(e) => {
                    tracing::warn!(directory = %dir.display(), error = %e, "cannot remove split directory");
                    failures.push((dir, e));
                }
            }
        }
        failures
    }

    /// `split_clean` plus forgetting every cached vector.
    pub fn clear(&mut self) -> Vec<(PathBuf, std::io::Error)> {
        let failures = self.split_clean();
        self.features.clear();
        failures
    }
}

/// `<dir>/<stem>_processed` next to the capture
pub fn processed_dir(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_processed", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_dir_is_sibling() {
        assert_eq!(
            processed_dir(Path::new("/data/day1.pcap")),
            PathBuf::from("/data/day1_processed")
        );
        assert_eq!(
            processed_dir(Path::new("trace.v2.pcapng")),
            PathBuf::from("trace.v2_processed")
        );
    }

    #[test]
    fn missing_capture_is_an_error() {
        let mut fx = FeatureExtractor::new(Splitter::native()).unwrap();
        let err = fx.extract(Path::new("/nonexistent/x.pcap"), 0).unwrap_err();
        assert!(matches!(err, TestbedError::Capture(_)));
        assert!(fx.get(Path::new("/nonexistent/x.pcap")).is_none());
    }

    #[test]
    fn split_clean_reports_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fx = FeatureExtractor::new(Splitter::native()).unwrap();
        let present = tmp.path().join("a_processed");
        std::fs::create_dir(&present).unwrap();
        fx.directories.push(tmp.path().join("gone_processed"));
        fx.directories.push(present.clone());

        let failures = fx.split_clean();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].0.ends_with("gone_processed"));
        assert!(!present.exists());
        assert!(fx.directories().is_empty());
    }
}
