//! Policy catalog with override precedence
//!
//! Resolution order for an instance: instance override, then the mapping
//! for the instance's research domain, then the global default.

use super::{IdlePolicy, InstanceOverride, PolicyConfig};
use crate::error::{IdleError, Result};
use tracing::warn;

/// An assignment referenced a policy that is not in the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPolicy {
    pub requested: String,
}

/// In-memory policy catalog backed by a `PolicyConfig` document
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    config: PolicyConfig,
    /// Cached copy of the default policy, always present
    default: IdlePolicy,
}

impl PolicyCatalog {
    /// Build a catalog, validating every policy. Errors here are fatal at startup.
    pub fn from_config(config: PolicyConfig) -> Result<Self> {
        for (key, policy) in &config.policies {
            policy.validate()?;
            if key != &policy.name {
                return Err(IdleError::invalid_policy(
                    key,
                    format!("catalog key does not match policy name '{}'", policy.name),
                ));
            }
        }

        let default = config
            .policies
            .get(&config.default_policy)
            .cloned()
            .ok_or_else(|| {
                IdleError::invalid_policy(&config.default_policy, "default policy is not defined")
            })?;

        for (domain, name) in &config.domain_mappings {
            if !config.policies.contains_key(name) {
                warn!(domain = %domain, policy = %name, "Domain mapping references unknown policy");
            }
        }
        for (instance_id, over) in &config.instance_overrides {
            if let Some(ref name) = over.policy {
                if !config.policies.contains_key(name) {
                    warn!(instance_id = %instance_id, policy = %name, "Instance override references unknown policy");
                }
            }
        }

        Ok(Self { config, default })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// All policies, ordered by name
    pub fn list(&self) -> Vec<IdlePolicy> {
        self.config.policies.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&IdlePolicy> {
        self.config.policies.get(name)
    }

    pub fn default_policy(&self) -> &IdlePolicy {
        &self.default
    }

    /// Add or replace a policy
    pub fn upsert(&mut self, policy: IdlePolicy) -> Result<()> {
        policy.validate()?;
        if policy.name == self.default.name {
            self.default = policy.clone();
        }
        self.config.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Remove a policy. Assignments still naming it fall back at resolution time.
    pub fn remove(&mut self, name: &str) -> Result<IdlePolicy> {
        if name == self.config.default_policy {
            return Err(IdleError::ProtectedPolicy {
                name: name.to_string(),
            });
        }
        self.config
            .policies
            .remove(name)
            .ok_or_else(|| self.not_found(name))
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        let policy = self.get(name).cloned().ok_or_else(|| self.not_found(name))?;
        self.config.default_policy = name.to_string();
        self.default = policy;
        Ok(())
    }

    pub fn set_domain_mapping(&mut self, domain: &str, policy: &str) -> Result<()> {
        self.ensure_exists(policy)?;
        self.config
            .domain_mappings
            .insert(domain.to_string(), policy.to_string());
        Ok(())
    }

    pub fn remove_domain_mapping(&mut self, domain: &str) -> Option<String> {
        self.config.domain_mappings.remove(domain)
    }

    /// Assign a policy to an instance, keeping any field overrides
    pub fn set_instance_policy(&mut self, instance_id: &str, policy: &str) -> Result<()> {
        self.ensure_exists(policy)?;
        self.config
            .instance_overrides
            .entry(instance_id.to_string())
            .or_default()
            .policy = Some(policy.to_string());
        Ok(())
    }

    pub fn set_instance_override(&mut self, instance_id: &str, over: InstanceOverride) -> Result<()> {
        if let Some(ref name) = over.policy {
            self.ensure_exists(name)?;
        }
        let mut candidate = self.default.clone();
        over.apply(&mut candidate);
        candidate.validate()?;

        self.config
            .instance_overrides
            .insert(instance_id.to_string(), over);
        Ok(())
    }

    pub fn clear_instance_override(&mut self, instance_id: &str) -> Option<InstanceOverride> {
        self.config.instance_overrides.remove(instance_id)
    }

    /// Resolve the effective policy for an instance
    pub fn resolve(
        &self,
        instance_id: &str,
        domain: Option<&str>,
    ) -> std::result::Result<IdlePolicy, MissingPolicy> {
        let over = self.config.instance_overrides.get(instance_id);

        let name = over
            .and_then(|o| o.policy.clone())
            .or_else(|| domain.and_then(|d| self.config.domain_mappings.get(d).cloned()))
            .unwrap_or_else(|| self.config.default_policy.clone());

        let mut policy = self
            .get(&name)
            .cloned()
            .ok_or(MissingPolicy { requested: name })?;

        if let Some(over) = over {
            over.apply(&mut policy);
        }
        Ok(policy)
    }

    fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.config.policies.contains_key(name) {
            Ok(())
        } else {
            Err(self.not_found(name))
        }
    }

    fn not_found(&self, name: &str) -> IdleError {
        IdleError::PolicyNotFound {
            policy: name.to_string(),
            fallback: self.default.name.clone(),
        }
    }
}

impl Default for PolicyCatalog {
    fn default() -> Self {
        let config = PolicyConfig::default();
        let default = config
            .policies
            .get(&config.default_policy)
            .cloned()
            .unwrap_or_else(|| super::builtin_policies().remove(0));
        Self { config, default }
    }
}
