//! YAML file configuration provider

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use super::ConfigurationProvider;
use crate::domain::{ConfigurationError, JobConfiguration};

const EXTENSIONS: [&str; 2] = ["yml", "yaml"];

/// Loads `{job_id}.yml` from a primary directory, then a fallback directory
#[derive(Debug, Clone)]
pub struct FileConfigurationProvider {
    primary: PathBuf,
    fallback: Option<PathBuf>,
}

impl FileConfigurationProvider {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<PathBuf>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Candidate paths in resolution order
    pub fn candidates(&self, job_id: &str) -> Vec<PathBuf> {
        std::iter::once(&self.primary)
            .chain(self.fallback.as_ref())
            .flat_map(|dir| EXTENSIONS.iter().map(move |ext| dir.join(format!("{}.{}", job_id, ext))))
            .collect()
    }
}

fn is_safe_job_id(job_id: &str) -> bool {
    !job_id.is_empty() && !job_id.contains(['/', '\\']) && job_id != "." && job_id != ".."
}

#[async_trait]
impl ConfigurationProvider for FileConfigurationProvider {
    async fn load(&self, job_id: &str) -> Result<JobConfiguration, ConfigurationError> {
        debug!(%job_id, primary = %self.primary.display(), "FileConfigurationProvider::load: called");
        if !is_safe_job_id(job_id) {
            return Err(ConfigurationError::Invalid(format!("invalid job id: {}", job_id)));
        }

        for path in self.candidates(job_id) {
            if !path.exists() {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            let config = JobConfiguration::from_yaml(&text)?;
            if config.job_id != job_id {
                return Err(ConfigurationError::Invalid(format!(
                    "{} declares job-id {}",
                    path.display(),
                    config.job_id
                )));
            }
            info!(%job_id, path = %path.display(), "Loaded job configuration");
            return Ok(config);
        }

        Err(ConfigurationError::NotFound(job_id.to_string()))
    }
}
