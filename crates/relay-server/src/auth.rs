use async_trait::async_trait;
use std::collections::HashMap;

/// Decides whether a connector may open a link for a tenant.
#[async_trait]
pub trait TenantAuthenticator: Send + Sync {
    async fn authenticate(&self, tenant_id: &str, secret: &str) -> bool;
}

/// Tenant secrets known at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticTenants {
    secrets: HashMap<String, String>,
}

impl StaticTenants {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl TenantAuthenticator for StaticTenants {
    async fn authenticate(&self, tenant_id: &str, secret: &str) -> bool {
        self.secrets
            .get(tenant_id)
            .is_some_and(|expected| expected.as_bytes() == secret.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tenants() {
        let tenants = StaticTenants::new(HashMap::from([("t1".to_string(), "s1".to_string())]));

        assert!(tenants.authenticate("t1", "s1").await);
        assert!(!tenants.authenticate("t1", "s2").await);
        assert!(!tenants.authenticate("t2", "s1").await);
    }
}
