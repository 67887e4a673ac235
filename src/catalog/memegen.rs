use super::*;
use serde::Deserialize;
use std::time::Instant;
use tokio::sync::RwLock;

/// How long a fetched template list is reused before asking the API again
const CACHE_TTL: Duration = Duration::from_secs(600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Template catalog backed by a memegen API instance
pub struct MemegenCatalog {
    base_url: String,
    client: reqwest::Client,
    cache: RwLock<Option<(Instant, Vec<PromptDescriptor>)>>,
}

#[derive(Debug, Deserialize)]
struct MemegenTemplate {
    id: String,
    name: String,
    #[serde(default)]
    lines: Option<u32>,
}

impl MemegenCatalog {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    fn to_descriptor(&self, template: MemegenTemplate) -> PromptDescriptor {
        PromptDescriptor {
            image_url: format!("{}/images/{}.png", self.base_url, template.id),
            id: template.id,
            name: template.name,
            lines: template.lines.unwrap_or(2),
        }
    }

    async fn fetch_templates(&self) -> CatalogResult<Vec<PromptDescriptor>> {
        let url = format!("{}/templates", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CatalogError::Timeout(REQUEST_TIMEOUT)
                } else {
                    CatalogError::ApiError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(CatalogError::ApiError(format!(
                "Template request failed with status {}",
                response.status()
            )));
        }

        let templates: Vec<MemegenTemplate> = response
            .json()
            .await
            .map_err(|e| CatalogError::ParseError(e.to_string()))?;

        Ok(templates
            .into_iter()
            .map(|t| self.to_descriptor(t))
            .collect())
    }

    async fn templates(&self) -> CatalogResult<Vec<PromptDescriptor>> {
        if let Some((fetched_at, templates)) = self.cache.read().await.as_ref() {
            if fetched_at.elapsed() < CACHE_TTL {
                return Ok(templates.clone());
            }
        }

        let templates = self.fetch_templates().await?;
        tracing::info!("Fetched {} templates from {}", templates.len(), self.base_url);
        *self.cache.write().await = Some((Instant::now(), templates.clone()));
        Ok(templates)
    }
}

#[async_trait]
impl PromptCatalog for MemegenCatalog {
    async fn random_prompts(&self, count: usize) -> CatalogResult<Vec<PromptDescriptor>> {
        let templates = self.templates().await?;
        if templates.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(pick_random(templates, count))
    }

    fn name(&self) -> &str {
        "memegen"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_mapping() {
        let catalog = MemegenCatalog::new("https://api.memegen.link/".to_string());
        let descriptor = catalog.to_descriptor(MemegenTemplate {
            id: "fry".to_string(),
            name: "Futurama Fry".to_string(),
            lines: None,
        });

        assert_eq!(descriptor.image_url, "https://api.memegen.link/images/fry.png");
        assert_eq!(descriptor.lines, 2);
    }

    #[test]
    fn test_template_json_shape() {
        let json = r#"[{"id":"gru","name":"Gru's Plan","lines":4,"blank":"x","example":{}}]"#;
        let templates: Vec<MemegenTemplate> = serde_json::from_str(json).unwrap();
        assert_eq!(templates[0].lines, Some(4));
    }

    #[tokio::test]
    async fn test_unreachable_api_reports_error() {
        let catalog = MemegenCatalog::new("http://127.0.0.1:9".to_string());
        assert!(catalog.random_prompts(3).await.is_err());
    }
}
