/// Answers whether an image URI is one of the platform's pre-built
/// prediction images.
pub trait ContainerCatalog: Send + Sync {
    fn is_prediction_image(&self, image_uri: &str) -> bool;
}

/// Recognises first-party prediction images by registry host and path.
#[derive(Clone, Debug)]
pub struct PrebuiltCatalog {
    /// `(host suffix, repository path prefix)` pairs.
    locations: Vec<(String, String)>,
}

impl Default for PrebuiltCatalog {
    fn default() -> Self {
        Self {
            locations: vec![
                ("-docker.pkg.dev".into(), "vertex-ai/prediction/".into()),
                ("-docker.pkg.dev".into(), "vertex-ai-restricted/prediction/".into()),
                ("gcr.io".into(), "cloud-aiplatform/prediction/".into()),
            ],
        }
    }
}

impl PrebuiltCatalog {
    pub fn with_location(mut self, host_suffix: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        self.locations.push((host_suffix.into(), path_prefix.into()));
        self
    }
}

impl ContainerCatalog for PrebuiltCatalog {
    fn is_prediction_image(&self, image_uri: &str) -> bool {
        let Some((host, path)) = image_uri.split_once('/') else {
            return false;
        };
        self.locations
            .iter()
            .any(|(suffix, prefix)| host.ends_with(suffix.as_str()) && path.starts_with(prefix.as_str()))
    }
}
