use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ServiceInstance, ServiceKey, ServiceType, validate_identifier};
use crate::errors::{BackupError, Result};

/// The services known to this process, as resolved from configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceKey, Arc<ServiceInstance>>,
}

impl ServiceRegistry {
    pub fn new(instances: impl IntoIterator<Item = ServiceInstance>) -> Result<Self> {
        let mut services = BTreeMap::new();
        for instance in instances {
            validate_identifier("service name", instance.name())?;
            let key = instance.key.clone();
            if services.insert(key.clone(), Arc::new(instance)).is_some() {
                return Err(BackupError::Validation(format!(
                    "service {key} is configured twice"
                )));
            }
        }
        Ok(Self { services })
    }

    pub fn get(&self, key: &ServiceKey) -> Option<Arc<ServiceInstance>> {
        self.services.get(key).cloned()
    }

    /// Resolves a service from raw request parameters.
    ///
    /// An unknown type is a validation error, an unknown name is not found.
    pub fn lookup(&self, service_type: &str, name: &str) -> Result<Arc<ServiceInstance>> {
        let service_type: ServiceType = service_type.parse()?;
        validate_identifier("service name", name)?;
        let key = ServiceKey::new(service_type, name);
        self.get(&key)
            .ok_or_else(|| BackupError::NotFound(format!("could not find service [{key}]")))
    }

    /// Services matching the optional type and name filters.
    pub fn filter(
        &self,
        service_type: Option<ServiceType>,
        name: Option<&str>,
    ) -> Vec<Arc<ServiceInstance>> {
        self.services
            .values()
            .filter(|s| service_type.is_none_or(|t| s.service_type() == t))
            .filter(|s| name.is_none_or(|n| s.name() == n))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ServiceInstance>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
