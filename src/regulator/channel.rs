use std::sync::Arc;

use super::quota::Quota;
use crate::config::ChannelConfig;

/// A tenant with its secret and ordered download/upload quota tiers.
#[derive(Debug)]
pub struct Channel {
    name: String,
    password: String,
    download_quotas: Vec<Arc<Quota>>,
    upload_quotas: Vec<Arc<Quota>>,
}

impl Channel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            password: config.password.clone(),
            download_quotas: config
                .download_quotas
                .iter()
                .map(|q| Arc::new(Quota::new(q.clone())))
                .collect(),
            upload_quotas: config
                .upload_quotas
                .iter()
                .map(|q| Arc::new(Quota::new(q.clone())))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn download_quotas(&self) -> &[Arc<Quota>] {
        &self.download_quotas
    }

    pub fn upload_quotas(&self) -> &[Arc<Quota>] {
        &self.upload_quotas
    }

    /// First download tier, in configured order, that accepts `num_bytes`.
    pub fn download_tier(&self, num_bytes: u64) -> Option<&Arc<Quota>> {
        select_tier(&self.download_quotas, num_bytes)
    }

    /// First upload tier, in configured order, that accepts `num_bytes`.
    pub fn upload_tier(&self, num_bytes: u64) -> Option<&Arc<Quota>> {
        select_tier(&self.upload_quotas, num_bytes)
    }
}

fn select_tier(tiers: &[Arc<Quota>], num_bytes: u64) -> Option<&Arc<Quota>> {
    tiers.iter().find(|q| num_bytes <= q.limits().max_file_size)
}
