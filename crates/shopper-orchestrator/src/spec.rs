use std::path::Path;

use serde::{Deserialize, Serialize};
use shopper_domain::OfferFilter;

use crate::error::OrchestratorError;

/// One benchmark test in the matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Lower runs first.
    pub priority: u32,
    pub gpu_type: String,
    #[serde(default)]
    pub provider: Option<String>,
    /// Model to benchmark (forwarded verbatim to the workload).
    pub model: String,
    #[serde(default)]
    pub min_vram_gb: Option<u32>,
    #[serde(default)]
    pub max_price_per_hour: Option<f64>,
}

impl TestSpec {
    /// Stable identifier used for log file names and reporting.
    pub fn worker_name(&self) -> String {
        let slug = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect::<String>()
                .split('-')
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        };
        format!("p{}-{}-{}", self.priority, slug(&self.gpu_type), slug(&self.model))
    }

    pub fn to_filter(&self) -> OfferFilter {
        OfferFilter {
            provider: self.provider.clone(),
            gpu_type: Some(self.gpu_type.clone()),
            min_vram_gb: self.min_vram_gb,
            max_price_per_hour: self.max_price_per_hour,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpecFile {
    specs: Vec<TestSpec>,
}

/// Load a benchmark matrix from a YAML file of the form:
///
/// ```yaml
/// specs:
///   - priority: 1
///     gpu_type: RTX 4090
///     model: llama-3.1-8b
///     min_vram_gb: 24
///     max_price_per_hour: 0.6
/// ```
pub fn load_specs(path: &Path) -> Result<Vec<TestSpec>, OrchestratorError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OrchestratorError::SpecFile(format!("{}: {}", path.display(), e)))?;
    let file: SpecFile = serde_yaml::from_str(&content)
        .map_err(|e| OrchestratorError::SpecFile(format!("{}: {}", path.display(), e)))?;
    let mut specs = file.specs;
    specs.sort_by_key(|s| s.priority);
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_load_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.yml");
        std::fs::write(
            &path,
            r#"
specs:
  - priority: 2
    gpu_type: A100
    model: llama-3.1-70b
  - priority: 1
    gpu_type: RTX 4090
    model: llama-3.1-8b
    min_vram_gb: 24
    max_price_per_hour: 0.6
"#,
        )
        .unwrap();

        let specs = load_specs(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].priority, 1);
        assert_eq!(specs[0].gpu_type, "RTX 4090");
        assert_eq!(specs[1].priority, 2);
    }

    #[test]
    fn worker_names_are_filesystem_safe() {
        let spec = TestSpec {
            priority: 1,
            gpu_type: "RTX 4090".to_string(),
            provider: None,
            model: "meta/Llama-3.1-8B".to_string(),
            min_vram_gb: None,
            max_price_per_hour: None,
        };
        assert_eq!(spec.worker_name(), "p1-rtx-4090-meta-llama-3-1-8b");
    }
}
