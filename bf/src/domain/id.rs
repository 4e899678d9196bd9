//! Correlation ID generation
//!
//! Every job execution carries one correlation ID through the worker pool,
//! the loader supervisor and every audit event it emits.
//!
//! Format: `{job-slug}-{uuid-v7}`
//! Example: `employees-daily-01930f6e-4c2a-7b7d-9a51-2f3c9b1d0e44`

use tracing::debug;

/// Generate a correlation ID for a job execution
pub fn generate_id(job_id: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let slug = slugify(job_id);
    if slug.is_empty() {
        uuid.to_string()
    } else {
        format!("{}-{}", slug, uuid)
    }
}

/// Slugify a job id for use in correlation IDs and artifact names
pub(crate) fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Correlation ID wrapper for type-safe propagation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new correlation ID for the given job
    pub fn new(job_id: &str) -> Self {
        let id = generate_id(job_id);
        debug!(%job_id, %id, "CorrelationId::new: called");
        Self(id)
    }

    /// Create from an existing ID string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the full ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the uuid portion (last 36 chars)
    pub fn uuid_part(&self) -> &str {
        let len = self.0.len();
        if len > 36 { &self.0[len - 36..] } else { &self.0 }
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for CorrelationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for CorrelationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id("Employees Daily");
        assert!(id.starts_with("employees-daily-"));
        assert_eq!(id.len(), "employees-daily-".len() + 36);
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id("job");
        let b = generate_id("job");
        assert_ne!(a, b);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("GL_ACCOUNTS.daily"), "gl-accounts-daily");
        assert_eq!(slugify("Multiple   Spaces"), "multiple-spaces");
        assert_eq!(slugify("payroll's feed"), "payrolls-feed");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_correlation_id_uuid_part() {
        let id = CorrelationId::new("orders");
        assert!(id.as_str().starts_with("orders-"));
        assert!(uuid::Uuid::parse_str(id.uuid_part()).is_ok());
    }

    #[test]
    fn test_correlation_id_serde() {
        let id = CorrelationId::from("orders-abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"orders-abc\"");
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
