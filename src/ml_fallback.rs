//! §4.D MLFallback — character n-gram similarity lookup against a
//! trained `provide → (binaryName, sourceName)` table, used only when
//! rule-based canonicalization in `name_canonicalizer` misses.
//!
//! The inference surface is intentionally the tiny `MlFallback` trait
//! so alternative implementations (edit distance, an embedding
//! service) are substitutable, per spec.md §9.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One training example: a provide token mapped to its real package
/// names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub provide: String,
    pub rpm_name: String,
    pub srpm_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub rpm_name: String,
    pub srpm_name: String,
    pub distance: f64,
}

/// Capability trait implemented by `NgramFallback`; kept tiny so the
/// canonicalizer doesn't need to know anything about vectorization.
pub trait MlFallback: Send + Sync {
    fn available(&self) -> bool;
    fn predict(&self, token: &str) -> Option<Prediction>;
}

type NgramVector = HashMap<String, f64>;

/// Character n-gram (n in 2..=5) nearest-neighbor index under cosine
/// distance, with k up to 5.
pub struct NgramFallback {
    examples: Vec<(TrainingExample, NgramVector)>,
    k: usize,
    distance_threshold: f64,
    prediction_cache: Mutex<PredictionCache>,
    cache_path: Option<PathBuf>,
}

impl NgramFallback {
    const MIN_N: usize = 2;
    const MAX_N: usize = 5;

    pub fn train(examples: Vec<TrainingExample>) -> anyhow::Result<Self> {
        if examples.is_empty() {
            anyhow::bail!("cannot train MLFallback on an empty example set");
        }
        let vectorized = examples
            .into_iter()
            .map(|example| {
                let vector = ngram_vector(&example.provide);
                (example, vector)
            })
            .collect();
        Ok(Self {
            examples: vectorized,
            k: 5,
            distance_threshold: crate::config::DEFAULT_ML_DISTANCE_THRESHOLD,
            prediction_cache: Mutex::new(PredictionCache::default()),
            cache_path: None,
        })
    }

    /// §4.D: a nearest neighbor farther than `threshold` is not a
    /// prediction, it's noise — `predict` returns `None` rather than
    /// the identity fallback deciding what to do with it.
    pub fn with_distance_threshold(mut self, threshold: f64) -> Self {
        self.distance_threshold = threshold;
        self
    }

    /// Persists the trained corpus as an opaque JSON blob. The format
    /// is intentionally treated as opaque by callers (§6: "The model
    /// artifact is an opaque binary blob"); JSON is merely this
    /// implementation's encoding of that blob.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw: Vec<&TrainingExample> = self.examples.iter().map(|(e, _)| e).collect();
        let bytes = serde_json::to_vec(&raw)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// `load(path) → Self`. Deserialization failure is not surfaced as
    /// an error to the caller of `NameCanonicalizer` — per §4.D, a
    /// model that fails to load simply makes `available() == false`
    /// via `MlFallback::maybe_load`.
    fn load(path: &Path, distance_threshold: f64) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let examples: Vec<TrainingExample> = serde_json::from_slice(&bytes)?;
        let mut fallback = Self::train(examples)?.with_distance_threshold(distance_threshold);
        fallback.cache_path = Some(prediction_cache_path_for(path));
        fallback.prediction_cache = Mutex::new(PredictionCache::load_tolerant(
            fallback.cache_path.as_deref().unwrap(),
        ));
        Ok(fallback)
    }

    /// Loads the model at `path` if present and well-formed, returning
    /// `None` (rather than propagating an error) on any failure — the
    /// caller degrades to rules-only canonicalization.
    pub fn maybe_load(path: &Path, distance_threshold: f64) -> Option<Self> {
        match Self::load(path, distance_threshold) {
            Ok(model) => Some(model),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ML fallback model unavailable, degrading to rules-only");
                None
            }
        }
    }

    fn nearest(&self, token: &str) -> Option<(&TrainingExample, f64)> {
        let query = ngram_vector(token);
        let mut scored: Vec<(&TrainingExample, f64)> = self
            .examples
            .iter()
            .map(|(example, vector)| (example, cosine_distance(&query, vector)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.k.max(1));
        scored.into_iter().next()
    }
}

impl MlFallback for NgramFallback {
    fn available(&self) -> bool {
        !self.examples.is_empty()
    }

    fn predict(&self, token: &str) -> Option<Prediction> {
        if let Some(cached) = self.prediction_cache.lock().unwrap().get(token) {
            return (cached.distance <= self.distance_threshold).then_some(cached);
        }
        let (example, distance) = self.nearest(token)?;
        let prediction = Prediction {
            rpm_name: example.rpm_name.clone(),
            srpm_name: example.srpm_name.clone(),
            distance,
        };
        debug!(token, distance, rpm = %prediction.rpm_name, "ML fallback nearest-neighbor prediction");
        let mut cache = self.prediction_cache.lock().unwrap();
        cache.insert(token.to_string(), prediction.clone());
        if let Some(path) = &self.cache_path {
            cache.persist(path);
        }
        if distance <= self.distance_threshold {
            Some(prediction)
        } else {
            debug!(token, distance, threshold = self.distance_threshold, "nearest neighbor outside threshold, no prediction");
            None
        }
    }
}

fn ngram_vector(token: &str) -> NgramVector {
    let chars: Vec<char> = token.chars().collect();
    let mut counts: HashMap<String, f64> = HashMap::new();
    for n in NgramFallback::MIN_N..=NgramFallback::MAX_N {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            let gram: String = window.iter().collect();
            *counts.entry(gram).or_insert(0.0) += 1.0;
        }
    }
    counts
}

fn cosine_distance(a: &NgramVector, b: &NgramVector) -> f64 {
    let dot: f64 = a.iter().map(|(k, v)| v * b.get(k).copied().unwrap_or(0.0)).sum();
    let norm_a: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let cosine_similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - cosine_similarity
}

/// Persistent, corruption-tolerant prediction cache. A
/// corrupt cache file is discarded and rewritten rather than treated
/// as fatal.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PredictionCache {
    entries: BTreeMap<String, CachedPrediction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPrediction {
    rpm: String,
    srpm: String,
    distance: f64,
}

impl PredictionCache {
    fn load_tolerant(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "discarding corrupt ML prediction cache");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn get(&self, token: &str) -> Option<Prediction> {
        self.entries.get(token).map(|c| Prediction {
            rpm_name: c.rpm.clone(),
            srpm_name: c.srpm.clone(),
            distance: c.distance,
        })
    }

    fn insert(&mut self, token: String, prediction: Prediction) {
        self.entries.insert(
            token,
            CachedPrediction {
                rpm: prediction.rpm_name,
                srpm: prediction.srpm_name,
                distance: prediction.distance,
            },
        );
    }

    fn persist(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(bytes) = serde_json::to_vec(&self.entries) {
            let _ = std::fs::write(path, bytes);
        }
    }
}

fn prediction_cache_path_for(model_path: &Path) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("srpmgraph")
        .join(format!(
            "ml-predictions-{}.json",
            model_path.file_stem().and_then(|s| s.to_str()).unwrap_or("default")
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_examples() -> Vec<TrainingExample> {
        vec![
            TrainingExample {
                provide: "libfoobar.so.2".to_string(),
                rpm_name: "foobar-libs".to_string(),
                srpm_name: "foobar".to_string(),
            },
            TrainingExample {
                provide: "python(abi)".to_string(),
                rpm_name: "python3".to_string(),
                srpm_name: "python3".to_string(),
            },
        ]
    }

    #[test]
    fn train_rejects_empty_corpus() {
        assert!(NgramFallback::train(vec![]).is_err());
    }

    #[test]
    fn predict_returns_closest_match() {
        let model = NgramFallback::train(sample_examples()).unwrap();
        let prediction = model.predict("libfoobar.so.3").unwrap();
        assert_eq!(prediction.rpm_name, "foobar-libs");
    }

    #[test]
    fn available_reflects_nonempty_corpus() {
        let model = NgramFallback::train(sample_examples()).unwrap();
        assert!(model.available());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.json");
        let model = NgramFallback::train(sample_examples()).unwrap();
        model.save(&model_path).unwrap();

        let reloaded = NgramFallback::maybe_load(&model_path, crate::config::DEFAULT_ML_DISTANCE_THRESHOLD).expect("reload succeeds");
        assert!(reloaded.available());
        let prediction = reloaded.predict("libfoobar.so.9").unwrap();
        assert_eq!(prediction.rpm_name, "foobar-libs");
    }

    #[test]
    fn predict_returns_none_beyond_distance_threshold() {
        let model = NgramFallback::train(sample_examples()).unwrap().with_distance_threshold(0.05);
        // Shares no n-grams with either training example, so its nearest
        // neighbor is at cosine distance 1.0 — well past the threshold.
        assert!(model.predict("zzzzzzzzzz").is_none());
    }

    #[test]
    fn maybe_load_degrades_gracefully_on_missing_file() {
        assert!(NgramFallback::maybe_load(Path::new("/nonexistent/model.json"), crate::config::DEFAULT_ML_DISTANCE_THRESHOLD).is_none());
    }

    #[test]
    fn maybe_load_degrades_gracefully_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.json");
        std::fs::write(&model_path, b"not json at all").unwrap();
        assert!(NgramFallback::maybe_load(&model_path, crate::config::DEFAULT_ML_DISTANCE_THRESHOLD).is_none());
    }

    #[test]
    fn corrupt_prediction_cache_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("predictions.json");
        std::fs::write(&cache_path, b"{not valid json").unwrap();
        let cache = PredictionCache::load_tolerant(&cache_path);
        assert!(cache.entries.is_empty());
    }
}
