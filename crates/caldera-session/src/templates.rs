//! Reusable session templates
//!
//! A template is a named overlay applied to a session request: resource and
//! image defaults, storage asks, environment, and TTLs. Built-in templates
//! are seeded at construction; the registry tracks usage counters.

use caldera_common::error::{Error, Result};
use caldera_common::types::{ResourceTier, UserType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Development,
    DataScience,
    WebDevelopment,
    MachineLearning,
    Testing,
    Custom,
}

/// Storage shape a template asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStorage {
    Ephemeral,
    Bucket,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTemplate {
    pub template_id: String,
    pub name: String,
    pub description: String,
    pub category: TemplateCategory,
    /// User types allowed to instantiate this template
    pub user_types: Vec<UserType>,
    pub resource_tier: ResourceTier,
    pub image_type: String,
    pub gpu_type: Option<String>,
    pub storage_type: TemplateStorage,
    pub storage_size_gb: u32,
    pub mount_path: String,
    pub default_ttl_minutes: u32,
    pub max_ttl_minutes: u32,
    pub env_vars: HashMap<String, String>,
    pub pre_install_commands: Vec<String>,
    pub tags: Vec<String>,
    pub estimated_cost_per_hour: Decimal,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl SessionTemplate {
    pub fn allows(&self, user_type: UserType) -> bool {
        self.user_types.contains(&user_type)
    }
}

/// Listing filters; all optional, combined with AND
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub category: Option<TemplateCategory>,
    pub user_type: Option<UserType>,
    pub tags: Vec<String>,
}

pub struct TemplateRegistry {
    templates: Arc<RwLock<HashMap<String, SessionTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        for template in builtin_templates() {
            map.insert(template.template_id.clone(), template);
        }
        Self {
            templates: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn get(&self, template_id: &str) -> Result<SessionTemplate> {
        self.templates
            .read()
            .await
            .get(template_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("template {template_id}")))
    }

    pub async fn list(&self, filter: &TemplateFilter) -> Vec<SessionTemplate> {
        let templates = self.templates.read().await;
        let mut matched: Vec<SessionTemplate> = templates
            .values()
            .filter(|t| {
                filter.category.map_or(true, |c| t.category == c)
                    && filter.user_type.map_or(true, |u| t.allows(u))
                    && filter.tags.iter().all(|tag| t.tags.contains(tag))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        matched
    }

    pub async fn create(&self, template: SessionTemplate) -> Result<()> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.template_id) {
            return Err(Error::conflict(format!(
                "template {} already exists",
                template.template_id
            )));
        }
        templates.insert(template.template_id.clone(), template);
        Ok(())
    }

    pub async fn update(&self, template: SessionTemplate) -> Result<()> {
        let mut templates = self.templates.write().await;
        if !templates.contains_key(&template.template_id) {
            return Err(Error::not_found(format!(
                "template {}",
                template.template_id
            )));
        }
        templates.insert(template.template_id.clone(), template);
        Ok(())
    }

    pub async fn delete(&self, template_id: &str) -> Result<bool> {
        Ok(self.templates.write().await.remove(template_id).is_some())
    }

    /// Bump the usage counter and stamp last use
    pub async fn increment_usage(&self, template_id: &str) -> Result<()> {
        let mut templates = self.templates.write().await;
        let template = templates
            .get_mut(template_id)
            .ok_or_else(|| Error::not_found(format!("template {template_id}")))?;
        template.usage_count += 1;
        template.last_used = Some(Utc::now());
        debug!(template_id = %template_id, usage_count = template.usage_count, "Template used");
        Ok(())
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_templates() -> Vec<SessionTemplate> {
    vec![
        SessionTemplate {
            template_id: "dev-python".to_string(),
            name: "Python Development".to_string(),
            description: "Python development environment with common tools".to_string(),
            category: TemplateCategory::Development,
            user_types: vec![UserType::Free, UserType::Pro, UserType::Enterprise],
            resource_tier: ResourceTier::Small,
            image_type: "python-basic".to_string(),
            gpu_type: None,
            storage_type: TemplateStorage::Ephemeral,
            storage_size_gb: 0,
            mount_path: "/workspace".to_string(),
            default_ttl_minutes: 120,
            max_ttl_minutes: 1440,
            env_vars: HashMap::from([
                ("PYTHONPATH".to_string(), "/workspace".to_string()),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ]),
            pre_install_commands: vec![
                "pip install --upgrade pip".to_string(),
                "pip install pytest black flake8".to_string(),
            ],
            tags: vec![
                "python".to_string(),
                "development".to_string(),
                "coding".to_string(),
            ],
            estimated_cost_per_hour: dec!(0.05),
            usage_count: 0,
            last_used: None,
        },
        SessionTemplate {
            template_id: "dev-nodejs".to_string(),
            name: "Node.js Development".to_string(),
            description: "Node.js development environment with npm and common tools".to_string(),
            category: TemplateCategory::WebDevelopment,
            user_types: vec![UserType::Pro, UserType::Enterprise],
            resource_tier: ResourceTier::Small,
            image_type: "nodejs-pro".to_string(),
            gpu_type: None,
            storage_type: TemplateStorage::Ephemeral,
            storage_size_gb: 0,
            mount_path: "/workspace".to_string(),
            default_ttl_minutes: 120,
            max_ttl_minutes: 1440,
            env_vars: HashMap::from([
                ("NODE_ENV".to_string(), "development".to_string()),
                ("NPM_CONFIG_CACHE".to_string(), "/workspace/.npm".to_string()),
            ]),
            pre_install_commands: vec!["npm install -g yarn typescript".to_string()],
            tags: vec![
                "nodejs".to_string(),
                "javascript".to_string(),
                "web".to_string(),
            ],
            estimated_cost_per_hour: dec!(0.075),
            usage_count: 0,
            last_used: None,
        },
        SessionTemplate {
            template_id: "ds-python".to_string(),
            name: "Data Science (Python)".to_string(),
            description: "Python data science environment with ML libraries".to_string(),
            category: TemplateCategory::DataScience,
            user_types: vec![UserType::Pro, UserType::Enterprise],
            resource_tier: ResourceTier::Medium,
            image_type: "python-pro".to_string(),
            gpu_type: None,
            storage_type: TemplateStorage::Bucket,
            storage_size_gb: 10,
            mount_path: "/workspace".to_string(),
            default_ttl_minutes: 240,
            max_ttl_minutes: 1440,
            env_vars: HashMap::from([
                ("PYTHONPATH".to_string(), "/workspace".to_string()),
                ("JUPYTER_ENABLE_LAB".to_string(), "yes".to_string()),
            ]),
            pre_install_commands: vec![
                "pip install pandas numpy matplotlib seaborn".to_string(),
                "pip install scikit-learn jupyter".to_string(),
            ],
            tags: vec![
                "python".to_string(),
                "data-science".to_string(),
                "jupyter".to_string(),
            ],
            estimated_cost_per_hour: dec!(0.10),
            usage_count: 0,
            last_used: None,
        },
        SessionTemplate {
            template_id: "ml-pytorch".to_string(),
            name: "PyTorch ML".to_string(),
            description: "PyTorch machine learning environment with GPU support".to_string(),
            category: TemplateCategory::MachineLearning,
            user_types: vec![UserType::Enterprise],
            resource_tier: ResourceTier::Gpu,
            image_type: "python-enterprise".to_string(),
            gpu_type: Some("t4".to_string()),
            storage_type: TemplateStorage::Bucket,
            storage_size_gb: 50,
            mount_path: "/workspace".to_string(),
            default_ttl_minutes: 480,
            max_ttl_minutes: 2880,
            env_vars: HashMap::from([(
                "TORCH_HOME".to_string(),
                "/workspace/.torch".to_string(),
            )]),
            pre_install_commands: vec!["pip install torch torchvision".to_string()],
            tags: vec![
                "pytorch".to_string(),
                "ml".to_string(),
                "gpu".to_string(),
            ],
            estimated_cost_per_hour: dec!(0.25),
            usage_count: 0,
            last_used: None,
        },
        SessionTemplate {
            template_id: "test-runner".to_string(),
            name: "Test Runner".to_string(),
            description: "Short-lived environment for CI-style test runs".to_string(),
            category: TemplateCategory::Testing,
            user_types: vec![UserType::Free, UserType::Pro, UserType::Enterprise],
            resource_tier: ResourceTier::Small,
            image_type: "alpine-basic".to_string(),
            gpu_type: None,
            storage_type: TemplateStorage::Ephemeral,
            storage_size_gb: 0,
            mount_path: "/workspace".to_string(),
            default_ttl_minutes: 30,
            max_ttl_minutes: 120,
            env_vars: HashMap::from([("CI".to_string(), "true".to_string())]),
            pre_install_commands: vec![],
            tags: vec!["testing".to_string(), "ci".to_string()],
            estimated_cost_per_hour: dec!(0.05),
            usage_count: 0,
            last_used: None,
        },
    ]
}
