//! Avatar authenticity classification: placeholder URL signatures plus dominant-colour sampling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use roster_core::{AvatarDecision, AvatarMethod};
use roster_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "roster-avatar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternMethod {
    UrlPattern,
    GravatarFallback,
    GravatarGeneric,
}

impl From<PatternMethod> for AvatarMethod {
    fn from(value: PatternMethod) -> Self {
        match value {
            PatternMethod::UrlPattern => AvatarMethod::UrlPattern,
            PatternMethod::GravatarFallback => AvatarMethod::GravatarFallback,
            PatternMethod::GravatarGeneric => AvatarMethod::GravatarGeneric,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderPattern {
    pub method: PatternMethod,
    pub pattern: String,
}

impl PlaceholderPattern {
    fn new(method: PatternMethod, pattern: &str) -> Self {
        Self {
            method,
            pattern: pattern.to_string(),
        }
    }
}

/// Built-in placeholder signatures, checked in order.
pub fn default_patterns() -> Vec<PlaceholderPattern> {
    use PatternMethod::*;
    vec![
        // gravatar serving the chat vendor's generated avatar as its fallback
        PlaceholderPattern::new(
            GravatarFallback,
            r"(?i)gravatar\.com/avatar/[^?]*\?(?:.*&)?(?:d|default)=[^&]*(?:slack-edge|ava_\d+)",
        ),
        PlaceholderPattern::new(GravatarGeneric, r"(?i)gravatar\.com/avatar/0{32}\b"),
        PlaceholderPattern::new(
            GravatarGeneric,
            r"(?i)gravatar\.com/avatar/[^?]*\?(?:.*&)?(?:d|default)=(?:mp|mm|mystery|identicon|monsterid|wavatar|retro|robohash|blank)(?:&|$)",
        ),
        PlaceholderPattern::new(
            GravatarGeneric,
            r"(?i)gravatar\.com/avatar/[^?]*\?(?:.*&)?(?:f|forcedefault)=(?:y|1)(?:&|$)",
        ),
        PlaceholderPattern::new(UrlPattern, r"(?i)/avatars/ava_\d+"),
        PlaceholderPattern::new(
            UrlPattern,
            r"(?i)(?:^|[/_.-])default[-_]?(?:avatar|profile|user|image|photo)",
        ),
        PlaceholderPattern::new(UrlPattern, r"(?i)/avatar[-_]?default"),
        PlaceholderPattern::new(UrlPattern, r"(?i)(?:^|[/_.-])placeholder"),
        PlaceholderPattern::new(
            UrlPattern,
            r"(?i)/(?:blank|anonymous|no[-_]?photo|nopic)[-_.]",
        ),
    ]
}

/// Compiled placeholder signatures; first match wins.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    compiled: Vec<(AvatarMethod, Regex)>,
}

impl PatternMatcher {
    pub fn new(patterns: &[PlaceholderPattern]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Ok((AvatarMethod::from(p.method), Regex::new(&p.pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { compiled })
    }

    pub fn match_url(&self, url: &str) -> Option<AvatarMethod> {
        self.compiled
            .iter()
            .find(|(_, re)| re.is_match(url))
            .map(|(method, _)| *method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    /// Side of the square canvas images are downscaled to before sampling.
    pub canvas: u32,
    pub sample_size: usize,
    /// Percentage of samples sharing one exact colour above which the image is a placeholder.
    pub coverage_threshold: f64,
    /// Fixed seed for reproducible sampling; a fresh seed per image when absent.
    pub seed: Option<u64>,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            canvas: 50,
            sample_size: 100,
            coverage_threshold: 70.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarPolicy {
    #[serde(default = "default_patterns")]
    pub patterns: Vec<PlaceholderPattern>,
    #[serde(flatten)]
    pub sampling: SamplingPolicy,
}

impl Default for AvatarPolicy {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            sampling: SamplingPolicy::default(),
        }
    }
}

/// Share (0..=100) of `samples` uniformly drawn pixels that fall in the most common colour.
pub fn dominant_color_coverage<R: Rng + ?Sized>(image: &RgbImage, samples: usize, rng: &mut R) -> f64 {
    let (width, height) = image.dimensions();
    if samples == 0 || width == 0 || height == 0 {
        return 0.0;
    }

    let mut buckets: HashMap<[u8; 3], usize> = HashMap::new();
    for _ in 0..samples {
        let x = rng.random_range(0..width);
        let y = rng.random_range(0..height);
        *buckets.entry(image.get_pixel(x, y).0).or_default() += 1;
    }
    let top = buckets.values().copied().max().unwrap_or(0);
    top as f64 / samples as f64 * 100.0
}

/// Decodes `bytes`, downscales to the policy canvas and measures dominant-colour coverage.
pub fn analyze_image_bytes(bytes: &[u8], policy: &SamplingPolicy) -> Result<f64, image::ImageError> {
    let side = policy.canvas.max(1);
    let canvas = image::load_from_memory(bytes)?
        .resize_exact(side, side, FilterType::Nearest)
        .to_rgb8();
    let mut rng = StdRng::seed_from_u64(policy.seed.unwrap_or_else(rand::random));
    Ok(dominant_color_coverage(&canvas, policy.sample_size, &mut rng))
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl ImageSource for HttpFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetch_bytes(url).await?.body)
    }
}

pub struct AvatarClassifier {
    images: Arc<dyn ImageSource>,
    matcher: PatternMatcher,
    sampling: SamplingPolicy,
}

impl AvatarClassifier {
    pub fn new(images: Arc<dyn ImageSource>, policy: &AvatarPolicy) -> Result<Self, regex::Error> {
        Ok(Self {
            images,
            matcher: PatternMatcher::new(&policy.patterns)?,
            sampling: policy.sampling.clone(),
        })
    }

    /// Decides placeholder vs authentic. Never fails: unreachable or undecodable
    /// images resolve to an authentic `analysis-failed` decision.
    pub async fn classify(&self, image_ref: Option<&str>, display_name: &str) -> AvatarDecision {
        let Some(url) = image_ref.map(str::trim).filter(|u| !u.is_empty()) else {
            return AvatarDecision::placeholder(AvatarMethod::NoImage);
        };

        if let Some(method) = self.matcher.match_url(url) {
            debug!(display_name, url, %method, "placeholder avatar signature");
            return AvatarDecision::placeholder(method);
        }

        let bytes = match self.images.fetch_image(url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(display_name, url, error = %err, "avatar fetch failed; keeping image");
                return AvatarDecision::authentic(AvatarMethod::AnalysisFailed);
            }
        };

        let sampling = self.sampling.clone();
        let analysis =
            tokio::task::spawn_blocking(move || analyze_image_bytes(&bytes, &sampling)).await;
        let coverage = match analysis {
            Ok(Ok(coverage)) => coverage,
            Ok(Err(err)) => {
                warn!(display_name, url, error = %err, "avatar decode failed; keeping image");
                return AvatarDecision::authentic(AvatarMethod::AnalysisFailed);
            }
            Err(err) => {
                warn!(display_name, url, error = %err, "avatar analysis task failed; keeping image");
                return AvatarDecision::authentic(AvatarMethod::AnalysisFailed);
            }
        };

        let is_default = coverage > self.sampling.coverage_threshold;
        debug!(display_name, url, coverage, is_default, "avatar colour analysis");
        AvatarDecision {
            is_default,
            method: if is_default {
                AvatarMethod::ColorAnalysis
            } else {
                AvatarMethod::RealAvatar
            },
            coverage: Some(coverage),
        }
    }
}
