mod memegen;

use crate::config::AppConfig;
use crate::types::PromptDescriptor;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::time::Duration;

pub use memegen::MemegenCatalog;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Response parsing failed: {0}")]
    ParseError(String),

    #[error("Catalog is empty")]
    Empty,
}

/// Source of prompt templates handed out each round
#[async_trait]
pub trait PromptCatalog: Send + Sync {
    /// Up to `count` distinct prompts in random order
    async fn random_prompts(&self, count: usize) -> CatalogResult<Vec<PromptDescriptor>>;

    fn name(&self) -> &str;
}

/// Shuffle `prompts` and keep the first `count`
pub(crate) fn pick_random(mut prompts: Vec<PromptDescriptor>, count: usize) -> Vec<PromptDescriptor> {
    prompts.shuffle(&mut rand::rng());
    prompts.truncate(count);
    prompts
}

/// Built-in templates for offline play and tests
const BUILTIN_TEMPLATES: &[(&str, &str, u32)] = &[
    ("drake", "Drakeposting", 2),
    ("db", "Distracted Boyfriend", 3),
    ("fry", "Futurama Fry", 2),
    ("buzz", "X, X Everywhere", 2),
    ("doge", "Doge", 2),
    ("fine", "This is Fine", 2),
    ("gru", "Gru's Plan", 4),
    ("cmm", "Change My Mind", 1),
    ("ds", "Daily Struggle", 3),
    ("pigeon", "Is This a Pigeon?", 3),
    ("spongebob", "Mocking Spongebob", 2),
    ("both", "Why Not Both?", 2),
    ("rollsafe", "Roll Safe", 2),
    ("success", "Success Kid", 2),
    ("aag", "Ancient Aliens Guy", 2),
    ("wonka", "Condescending Wonka", 2),
    ("mordor", "One Does Not Simply Walk into Mordor", 2),
    ("stonks", "Stonks", 2),
    ("exit", "Left Exit 12 Off Ramp", 3),
    ("astronaut", "Always Has Been", 4),
];

pub struct StaticCatalog {
    prompts: Vec<PromptDescriptor>,
}

impl StaticCatalog {
    pub fn new(prompts: Vec<PromptDescriptor>) -> Self {
        Self { prompts }
    }

    /// The built-in template list, with image URLs pointing at `image_base`
    pub fn builtin(image_base: &str) -> Self {
        let prompts = BUILTIN_TEMPLATES
            .iter()
            .map(|(id, name, lines)| PromptDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                image_url: format!("{}/images/{}.png", image_base, id),
                lines: *lines,
            })
            .collect();
        Self { prompts }
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::builtin(crate::config::DEFAULT_CATALOG_URL)
    }
}

#[async_trait]
impl PromptCatalog for StaticCatalog {
    async fn random_prompts(&self, count: usize) -> CatalogResult<Vec<PromptDescriptor>> {
        if self.prompts.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(pick_random(self.prompts.clone(), count))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Build the catalog selected by the configuration
pub fn from_config(config: &AppConfig) -> Box<dyn PromptCatalog> {
    match &config.catalog_url {
        Some(url) => {
            tracing::info!("Using memegen template catalog at {}", url);
            Box::new(MemegenCatalog::new(url.clone()))
        }
        None => {
            tracing::info!("Using built-in template catalog");
            Box::new(StaticCatalog::default())
        }
    }
}
