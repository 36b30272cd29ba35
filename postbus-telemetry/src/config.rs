//! Configuration for OpenTelemetry

use crate::error::{TelemetryError, TelemetryResult};
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use serde::{Deserialize, Serialize};
use std::env;

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: Option<String>,

    /// Environment (e.g., "production", "staging", "development")
    pub environment: Option<String>,

    /// Enable tracing
    pub enable_tracing: bool,

    /// Tracing configuration
    pub tracing: TracingConfig,

    /// Additional resource attributes
    pub resource_attributes: Vec<(String, String)>,
}

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Exporter type
    pub exporter: TracingExporter,

    /// OTLP endpoint (if using OTLP)
    pub otlp_endpoint: Option<String>,

    /// Sampling ratio (0.0 to 1.0)
    pub sampling_ratio: f64,

    /// Maximum attributes per span
    pub max_attributes_per_span: u32,

    /// Maximum events per span
    pub max_events_per_span: u32,
}

/// Tracing exporter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    /// OTLP exporter (OpenTelemetry Protocol)
    Otlp,
    /// No exporter; spans are sampled but dropped
    None,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "postbus-service".to_string(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            environment: Some("development".to_string()),
            enable_tracing: true,
            tracing: TracingConfig::default(),
            resource_attributes: Vec::new(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            exporter: TracingExporter::Otlp,
            otlp_endpoint: Some("http://localhost:4317".to_string()),
            sampling_ratio: 1.0,
            max_attributes_per_span: 128,
            max_events_per_span: 128,
        }
    }
}

impl TelemetryConfig {
    /// Create a new telemetry configuration
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from the standard `OTEL_*` variables plus
    /// `POSTBUS_TRACING_EXPORTER` and `POSTBUS_TRACING_SAMPLING_RATIO`.
    pub fn from_env() -> TelemetryResult<Self> {
        let mut config = Self::default();

        if let Ok(name) = env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.tracing.otlp_endpoint = Some(endpoint);
        }
        if let Ok(exporter) = env::var("POSTBUS_TRACING_EXPORTER") {
            config.tracing.exporter = match exporter.to_lowercase().as_str() {
                "otlp" => TracingExporter::Otlp,
                "none" => TracingExporter::None,
                other => {
                    return Err(TelemetryError::Config(format!(
                        "Unknown tracing exporter: {}",
                        other
                    )));
                }
            };
        }
        if let Ok(ratio) = env::var("POSTBUS_TRACING_SAMPLING_RATIO") {
            config.tracing.sampling_ratio = ratio.parse().map_err(|_| {
                TelemetryError::Config(format!("Invalid sampling ratio: {}", ratio))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set service version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Set environment
    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    /// Enable or disable tracing
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    /// Use the given exporter
    pub fn with_exporter(mut self, exporter: TracingExporter) -> Self {
        self.tracing.exporter = exporter;
        self
    }

    /// Set the OTLP endpoint
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.tracing.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Set the sampling ratio
    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.tracing.sampling_ratio = ratio;
        self
    }

    /// Add a resource attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.push((key.into(), value.into()));
        self
    }

    /// Create OpenTelemetry resource from configuration
    pub fn create_resource(&self) -> Resource {
        let mut attributes = Vec::new();

        if let Some(ref version) = self.service_version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version.clone()));
        }

        if let Some(ref env) = self.environment {
            attributes.push(KeyValue::new("deployment.environment", env.clone()));
        }

        for (key, value) in &self.resource_attributes {
            attributes.push(KeyValue::new(key.clone(), value.clone()));
        }

        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(attributes)
            .build()
    }

    /// Validate configuration
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.service_name.is_empty() {
            return Err(TelemetryError::Config(
                "Service name cannot be empty".to_string(),
            ));
        }

        if self.enable_tracing
            && self.tracing.exporter == TracingExporter::Otlp
            && self.tracing.otlp_endpoint.is_none()
        {
            return Err(TelemetryError::Config(
                "OTLP endpoint required for OTLP tracing exporter".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.tracing.sampling_ratio) {
            return Err(TelemetryError::Config(
                "Sampling ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();

        assert_eq!(config.service_name, "postbus-service");
        assert!(config.enable_tracing);
        assert_eq!(config.tracing.exporter, TracingExporter::Otlp);
        assert_eq!(config.tracing.sampling_ratio, 1.0);
    }

    #[test]
    fn test_config_builder() {
        let config = TelemetryConfig::new("orders")
            .with_version("2.1.0")
            .with_environment("staging")
            .with_attribute("team", "payments")
            .with_exporter(TracingExporter::None);

        assert_eq!(config.service_name, "orders");
        assert_eq!(config.service_version, Some("2.1.0".to_string()));
        assert_eq!(config.environment, Some("staging".to_string()));
        assert_eq!(config.resource_attributes.len(), 1);
        assert_eq!(config.tracing.exporter, TracingExporter::None);
    }

    #[test]
    fn test_config_validate_empty_service_name() {
        let config = TelemetryConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_sampling_ratio() {
        assert!(TelemetryConfig::new("svc").with_sampling_ratio(1.5).validate().is_err());
        assert!(TelemetryConfig::new("svc").with_sampling_ratio(-0.1).validate().is_err());
        assert!(TelemetryConfig::new("svc").with_sampling_ratio(0.25).validate().is_ok());
    }

    #[test]
    fn test_otlp_requires_endpoint() {
        let mut config = TelemetryConfig::new("svc");
        config.tracing.otlp_endpoint = None;
        assert!(config.validate().is_err());

        config.tracing.exporter = TracingExporter::None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_create_resource() {
        let resource = TelemetryConfig::new("orders").create_resource();
        assert!(!resource.is_empty());
    }
}
