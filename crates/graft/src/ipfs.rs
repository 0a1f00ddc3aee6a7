// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Production [`SubgraphManifestResolver`] backed by an IPFS HTTP gateway.

use async_trait::async_trait;
use thegraph_core::DeploymentId;

use crate::{Manifest, SubgraphManifestResolver};

pub struct IpfsManifestResolver {
    http: reqwest::Client,
    ipfs_base: String,
}

impl IpfsManifestResolver {
    pub fn new(http: reqwest::Client, ipfs_base: impl Into<String>) -> Self {
        Self {
            http,
            ipfs_base: ipfs_base.into(),
        }
    }
}

#[async_trait]
impl SubgraphManifestResolver for IpfsManifestResolver {
    async fn manifest(&self, deployment: DeploymentId) -> anyhow::Result<Manifest> {
        let url = format!("{}/api/v0/cat?arg={}", self.ipfs_base, deployment.ipfs_hash());
        let body = self.http.post(&url).send().await?.error_for_status()?.text().await?;
        let manifest: Manifest = serde_yaml::from_str(&body)?;
        Ok(manifest)
    }
}
