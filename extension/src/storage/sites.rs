//! Sites the user has connected, keyed by host

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use super::{StorageBackend, Store};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedSite {
    pub id: String,
    pub origin: String,
    pub url: String,
    /// Substrate-style accounts exposed to the site
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_addresses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_chain_id: Option<u64>,
    #[serde(default)]
    pub connect_all_substrate: bool,
}

pub type AuthorizedSites = BTreeMap<String, AuthorizedSite>;

/// Host (with port, if any) of `url`; unparseable input is returned as is
pub fn strip_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let host = parsed.host_str()?.to_string();
            Some(match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            })
        })
        .unwrap_or_else(|| url.to_string())
}

pub struct SitesStore {
    store: Store<AuthorizedSites>,
}

impl SitesStore {
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Ok(Self {
            store: Store::load("sites", backend).await?,
        })
    }

    pub fn get_site_from_url(&self, url: &str) -> Option<AuthorizedSite> {
        self.store.get().get(&strip_url(url)).cloned()
    }

    pub fn sites(&self) -> AuthorizedSites {
        self.store.get()
    }

    /// Insert or replace the entry for the site's host
    pub async fn set(&self, site: AuthorizedSite) -> Result<()> {
        let key = strip_url(&site.url);
        self.store
            .update(|sites| {
                sites.insert(key, site);
            })
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }
}
