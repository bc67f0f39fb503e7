//! Secret/parameter backend.
//!
//! The core only needs "fetch secret by name". Production uses SSM Parameter
//! Store with decryption; tests substitute an in-memory map.

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Fetch a decrypted parameter value by name.
    async fn get(&self, name: &str) -> Result<String>;
}

/// SSM Parameter Store backend.
pub struct SsmParameterStore {
    client: aws_sdk_ssm::Client,
}

impl SsmParameterStore {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(config),
        }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .with_context(|| format!("Failed to fetch parameter {}", name))?;

        response
            .parameter
            .and_then(|p| p.value)
            .ok_or_else(|| anyhow::anyhow!("Parameter {} has no value", name))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory parameter store for tests.
    pub struct MapParameterStore {
        values: HashMap<String, String>,
    }

    impl MapParameterStore {
        pub fn new(values: HashMap<String, String>) -> Self {
            Self { values }
        }
    }

    #[async_trait]
    impl ParameterStore for MapParameterStore {
        async fn get(&self, name: &str) -> Result<String> {
            self.values
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Parameter {} not found", name))
        }
    }
}
