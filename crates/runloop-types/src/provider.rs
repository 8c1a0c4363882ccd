use serde::{Deserialize, Serialize};

/// Model selection for a run. Unset fields fall back to the registry default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default, alias = "providerId")]
    pub provider_id: Option<String>,
    #[serde(default, alias = "modelId")]
    pub model_id: Option<String>,
}

impl ModelSpec {
    pub fn provider(&self) -> Option<&str> {
        self.provider_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn model(&self) -> Option<&str> {
        self.model_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    pub context_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}
