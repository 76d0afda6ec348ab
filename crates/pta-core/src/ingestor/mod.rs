// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metadata ingestor.
//!
//! Keeps challenge rows consistent with the `chall.yml` descriptors in the
//! object store. A descriptor that exists is parsed, its referenced files
//! checked, and the challenge reconciled in one store call; a descriptor that
//! is gone deletes the challenge.
//!
//! Syncs for the same slug are serialized; different slugs run in parallel.

pub mod cover;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Audience, Event, publish};
use crate::config::DeletePolicy;
use crate::deps::Deps;
use crate::descriptor::{DESCRIPTOR_FILE, Descriptor, DescriptorError, descriptor_slug};
use crate::error::{Error, Result};
use crate::export;
use crate::keyed::KeyedLocks;
use crate::models::{Challenge, DecayFormula};
use crate::object_store::{Bucket, ObjectStoreError, get_bytes, list_all};
use crate::orchestrator::Orchestrator;
use crate::slug::{generate_slug, is_valid_slug, unique_slug};

/// Largest accepted descriptor.
pub const MAX_DESCRIPTOR_BYTES: u64 = 1024 * 1024;

/// Largest accepted challenge file.
pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;

/// Largest accepted sum of a challenge's files.
pub const MAX_TOTAL_FILE_BYTES: u64 = 200 * 1024 * 1024;

/// Ingestor settings.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// What happens to running instances of a deleted challenge.
    pub delete_policy: DeletePolicy,
    /// Wait before re-checking a descriptor a notification named but the
    /// store does not show yet.
    pub visibility_retry_delay: Duration,
    /// Challenges synced in parallel by a bulk scan.
    pub scan_concurrency: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            delete_policy: DeletePolicy::Detach,
            visibility_retry_delay: Duration::from_millis(500),
            scan_concurrency: 4,
        }
    }
}

/// What a sync did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Challenge upserted.
    Synced(Challenge),
    /// Descriptor gone; the challenge was deleted if it existed.
    Deleted { slug: String, existed: bool },
    /// Key is not a descriptor.
    Ignored,
}

/// A challenge the bulk scan could not sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
    /// Directory that failed.
    pub slug: String,
    /// Error message.
    pub error: String,
}

/// Result of a bulk scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Challenges synced.
    pub synced: usize,
    /// Per-slug failures, sorted by slug.
    pub errors: Vec<SyncFailure>,
}

struct Inner {
    deps: Deps,
    orchestrator: Orchestrator,
    config: IngestorConfig,
    slugs: KeyedLocks<String>,
}

/// Descriptor-to-database reconciler. Cheap to clone.
#[derive(Clone)]
pub struct Ingestor {
    inner: Arc<Inner>,
}

impl Ingestor {
    /// Create an ingestor. The orchestrator is used only by the `stop`
    /// delete policy.
    pub fn new(deps: Deps, orchestrator: Orchestrator, config: IngestorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                orchestrator,
                config,
                slugs: KeyedLocks::new(),
            }),
        }
    }

    fn deps(&self) -> &Deps {
        &self.inner.deps
    }

    /// Sync every descriptor in the challenges bucket.
    pub async fn bulk_scan(&self) -> Result<SyncReport> {
        let keys = list_all(self.deps().objects.as_ref(), Bucket::Challenges, "", true).await?;
        let (slugs, misnamed): (BTreeSet<String>, BTreeSet<String>) = keys
            .iter()
            .filter_map(|key| descriptor_slug(key))
            .map(str::to_string)
            .partition(|name| is_valid_slug(name));

        let mut report = SyncReport::default();
        for name in misnamed {
            let err = Error::from(DescriptorError::InvalidSlug(name.clone()));
            let error = match unique_slug(&name, |s| slugs.contains(s)) {
                Some(suggested) => format!("{}, rename the directory to '{}'", err, suggested),
                None => err.to_string(),
            };
            warn!(slug = %name, error = %error, "Skipping challenge directory");
            report.errors.push(SyncFailure { slug: name, error });
        }

        info!(descriptors = slugs.len(), "Starting challenge scan");

        let results: Vec<(String, Result<SyncOutcome>)> = futures::stream::iter(slugs)
            .map(|slug| async move {
                let result = self.sync_slug(&slug).await;
                (slug, result)
            })
            .buffer_unordered(self.inner.config.scan_concurrency.max(1))
            .collect()
            .await;

        for (slug, result) in results {
            match result {
                Ok(SyncOutcome::Synced(_)) => report.synced += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(slug = %slug, error = %e, "Challenge sync failed");
                    report.errors.push(SyncFailure {
                        slug,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.errors.sort_by(|a, b| a.slug.cmp(&b.slug));

        info!(
            synced = report.synced,
            failed = report.errors.len(),
            "Challenge scan finished"
        );
        Ok(report)
    }

    /// Sync the challenge a change notification refers to.
    pub async fn sync_key(&self, key: &str) -> Result<SyncOutcome> {
        match descriptor_slug(key) {
            Some(slug) => self.sync_slug(slug).await,
            None => {
                debug!(key, "Ignoring non-descriptor key");
                Ok(SyncOutcome::Ignored)
            }
        }
    }

    /// Sync one challenge by slug.
    pub async fn sync_slug(&self, slug: &str) -> Result<SyncOutcome> {
        if !is_valid_slug(slug) {
            warn!(
                slug,
                suggested = %generate_slug(slug),
                "Rejecting challenge directory with invalid slug"
            );
            return Err(DescriptorError::InvalidSlug(slug.to_string()).into());
        }
        let _guard = self.inner.slugs.lock(slug.to_string()).await;
        let key = format!("{}/{}", slug, DESCRIPTOR_FILE);

        match self.stat_descriptor(&key).await {
            Ok(()) => self.apply(slug, &key).await.map(SyncOutcome::Synced),
            Err(e) if e.is_not_found() => self.remove(slug).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn stat_descriptor(&self, key: &str) -> std::result::Result<(), ObjectStoreError> {
        let objects = self.deps().objects.as_ref();
        match objects.stat(Bucket::Challenges, key).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tokio::time::sleep(self.inner.config.visibility_retry_delay).await;
                objects.stat(Bucket::Challenges, key).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, slug: &str, key: &str) -> Result<Challenge> {
        let deps = self.deps();
        let raw = get_bytes(
            deps.objects.as_ref(),
            Bucket::Challenges,
            key,
            MAX_DESCRIPTOR_BYTES,
        )
        .await?;
        let text = std::str::from_utf8(&raw)
            .map_err(|_| DescriptorError::Invalid("chall.yml is not valid UTF-8".into()))?;
        let descriptor = Descriptor::parse(text)?;

        let decay_formula_id = self.resolve_decay(&descriptor).await?;
        self.check_files(slug, &descriptor).await?;

        let cover = descriptor.cover_img.clone();
        let sync = descriptor.into_sync(slug, decay_formula_id)?;
        let mut challenge = deps.store.sync_challenge(&sync).await?;

        if let Some(name) = cover {
            match cover::process(deps.objects.as_ref(), slug, &name).await {
                Ok(file) => {
                    deps.store.set_cover_img(challenge.id, Some(&file)).await?;
                    challenge.cover_img = Some(file);
                }
                Err(e) => warn!(slug, cover = %name, error = %e, "Cover processing failed"),
            }
        }

        self.drop_export_cache(slug).await;
        publish(
            deps.broadcaster.as_ref(),
            Audience::All,
            &Event::category("minio_sync"),
        );

        info!(
            slug,
            challenge_id = challenge.id,
            challenge_type = %challenge.challenge_type,
            "Challenge synced"
        );
        Ok(challenge)
    }

    /// Formula id to assign: `None` keeps the current one (or the default
    /// on insert).
    async fn resolve_decay(&self, descriptor: &Descriptor) -> Result<Option<i32>> {
        let Some(name) = descriptor.decay_name() else {
            return Ok(None);
        };
        let store = &self.deps().store;
        if let Some(formula) = store.decay_formula_by_name(name).await? {
            return Ok(Some(formula.id));
        }
        warn!(decay = name, "Unknown decay formula, using default");
        Ok(store
            .decay_formula_by_name(DecayFormula::DEFAULT_NAME)
            .await?
            .map(|f| f.id))
    }

    async fn check_files(&self, slug: &str, descriptor: &Descriptor) -> Result<()> {
        let objects = self.deps().objects.as_ref();
        let mut total: u64 = 0;
        for name in &descriptor.files {
            let key = format!("{}/{}", slug, name);
            let info = match objects.stat(Bucket::Challenges, &key).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => {
                    return Err(DescriptorError::Invalid(format!("file '{}' not found", name)).into());
                }
                Err(e) => return Err(e.into()),
            };
            if info.size > MAX_FILE_BYTES {
                return Err(DescriptorError::Invalid(format!(
                    "file '{}' exceeds {} bytes",
                    name, MAX_FILE_BYTES
                ))
                .into());
            }
            total += info.size;
            if total > MAX_TOTAL_FILE_BYTES {
                return Err(DescriptorError::Invalid(format!(
                    "files exceed {} bytes in total",
                    MAX_TOTAL_FILE_BYTES
                ))
                .into());
            }
        }
        Ok(())
    }

    async fn remove(&self, slug: &str) -> Result<SyncOutcome> {
        let deps = self.deps();
        let Some(deleted) = deps.store.delete_challenge_by_slug(slug).await? else {
            debug!(slug, "Descriptor gone and no challenge to delete");
            return Ok(SyncOutcome::Deleted {
                slug: slug.to_string(),
                existed: false,
            });
        };

        if !deleted.instances.is_empty() {
            match self.inner.config.delete_policy {
                DeletePolicy::Stop => {
                    self.inner
                        .orchestrator
                        .release_instances(deleted.challenge.challenge_type, &deleted.instances)
                        .await;
                }
                DeletePolicy::Detach => warn!(
                    slug,
                    instances = deleted.instances.len(),
                    "Challenge deleted with running instances; runtime resources left in place"
                ),
            }
        }

        self.drop_export_cache(slug).await;
        publish(
            deps.broadcaster.as_ref(),
            Audience::All,
            &Event::category("minio_sync"),
        );
        info!(slug, challenge_id = deleted.challenge.id, "Challenge deleted");
        Ok(SyncOutcome::Deleted {
            slug: slug.to_string(),
            existed: true,
        })
    }

    async fn drop_export_cache(&self, slug: &str) {
        let key = export::cache_key(slug);
        match self.deps().objects.delete(Bucket::Challenges, &key).await {
            Ok(()) => debug!(key = %key, "Export cache invalidated"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to invalidate export cache"),
        }
    }
}
