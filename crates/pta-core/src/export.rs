// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redistributable challenge archive.
//!
//! The archive holds a `chall.yml` regenerated from the database with every
//! flag replaced by `REDACTED`, plus every object under `<slug>/` except the
//! source descriptor and the resized cover. The result is cached at
//! `<slug>.zip` in the challenges bucket; the ingestor drops the cache
//! whenever the challenge changes.

use std::io::{Cursor, Write};

use bytes::Bytes;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::deps::Deps;
use crate::descriptor::{
    DESCRIPTOR_FILE, Descriptor, DescriptorHint, FirstBloodSpec, REDACTED,
};
use crate::error::{Error, Result};
use crate::ingestor::MAX_FILE_BYTES;
use crate::ingestor::cover::RESIZED_STEM;
use crate::models::{Challenge, ChallengeType};
use crate::object_store::{Bucket, get_bytes, list_all};

/// Content type of the archive.
pub const CONTENT_TYPE: &str = "application/zip";

/// Cache key of a challenge's archive in the challenges bucket.
pub fn cache_key(slug: &str) -> String {
    format!("{}.zip", slug)
}

/// A built or cached archive.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    /// Download file name.
    pub file_name: String,
    /// ZIP contents.
    pub bytes: Bytes,
}

/// Archive for `challenge_id`, from cache when present.
pub async fn export_challenge(deps: &Deps, challenge_id: i32) -> Result<ExportArchive> {
    let challenge = deps
        .store
        .challenge(challenge_id)
        .await?
        .ok_or(Error::ChallengeNotFound)?;
    let key = cache_key(&challenge.slug);
    let file_name = key.clone();

    match get_bytes(deps.objects.as_ref(), Bucket::Challenges, &key, u64::MAX).await {
        Ok(bytes) => {
            debug!(slug = %challenge.slug, "Serving cached export");
            return Ok(ExportArchive { file_name, bytes });
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let bytes = build_archive(deps, &challenge).await?;
    if let Err(e) = deps
        .objects
        .put(Bucket::Challenges, &key, bytes.clone(), CONTENT_TYPE)
        .await
    {
        warn!(key = %key, error = %e, "Failed to cache export");
    }
    info!(slug = %challenge.slug, size = bytes.len(), "Export archive built");
    Ok(ExportArchive { file_name, bytes })
}

/// Regenerate the descriptor of a stored challenge. Flags are redacted.
pub async fn descriptor_from_db(deps: &Deps, challenge: &Challenge) -> Result<Descriptor> {
    let store = &deps.store;
    let flags = store.flags(challenge.id).await?;
    let hints = store.hints_for_challenge(challenge.id).await?;
    let decay = match challenge.decay_formula_id {
        Some(id) => store.decay_formula(id).await?.map(|f| f.name),
        None => None,
    };
    let geo = if challenge.challenge_type == ChallengeType::Geo {
        store.geo_spec(challenge.id).await?
    } else {
        None
    };

    let first_blood = (challenge.enable_first_blood || !challenge.first_blood_bonuses.is_empty())
        .then(|| FirstBloodSpec {
            bonuses: challenge.first_blood_bonuses.clone(),
            badges: challenge.first_blood_badges.clone(),
        });

    Ok(Descriptor {
        name: challenge.name.clone(),
        description: challenge.description.clone(),
        category: challenge.category.clone(),
        difficulty: challenge.difficulty.clone(),
        challenge_type: challenge.challenge_type.as_str().to_string(),
        decay,
        author: challenge.author.clone(),
        hidden: challenge.hidden,
        points: challenge.points,
        attempts: challenge.max_attempts,
        ports: challenge.ports.clone(),
        connection_info: challenge.connection_info.clone(),
        cover_img: source_cover_name(deps, &challenge.slug).await,
        files: challenge.files.clone(),
        flags: flags.iter().map(|_| REDACTED.to_string()).collect(),
        hints: hints
            .into_iter()
            .map(|h| DescriptorHint {
                title: h.title,
                content: h.content,
                cost: h.cost,
                is_active: Some(h.is_active),
                auto_active_at: h.auto_active_at.map(|t| t.to_rfc3339()),
            })
            .collect(),
        first_blood,
        enable_first_blood: Some(challenge.enable_first_blood),
        depends_on: challenge.depends_on.clone(),
        emoji: challenge.emoji.clone(),
        target_lat: geo.map(|g| g.target_lat),
        target_lng: geo.map(|g| g.target_lng),
        radius_km: geo.map(|g| g.radius_km),
    })
}

// The database keeps the derivative name; the archive ships the original.
async fn source_cover_name(deps: &Deps, slug: &str) -> Option<String> {
    let key = format!("{}/{}", slug, DESCRIPTOR_FILE);
    let raw = get_bytes(deps.objects.as_ref(), Bucket::Challenges, &key, 1024 * 1024)
        .await
        .ok()?;
    let source: Descriptor = serde_yaml::from_slice(&raw).ok()?;
    source.cover_img
}

fn is_exported(relative: &str) -> bool {
    if relative.is_empty() || relative.ends_with('/') || relative == DESCRIPTOR_FILE {
        return false;
    }
    let base = relative.rsplit('/').next().unwrap_or(relative);
    !base.starts_with(&format!("{}.", RESIZED_STEM))
}

async fn build_archive(deps: &Deps, challenge: &Challenge) -> Result<Bytes> {
    let descriptor = descriptor_from_db(deps, challenge).await?;
    let yaml = descriptor.to_yaml()?;

    let prefix = format!("{}/", challenge.slug);
    let keys = list_all(deps.objects.as_ref(), Bucket::Challenges, &prefix, true).await?;

    let mut entries = vec![(DESCRIPTOR_FILE.to_string(), Bytes::from(yaml))];
    for key in keys {
        let Some(relative) = key.strip_prefix(&prefix) else {
            continue;
        };
        if !is_exported(relative) {
            continue;
        }
        let body = get_bytes(deps.objects.as_ref(), Bucket::Challenges, &key, MAX_FILE_BYTES).await?;
        entries.push((relative.to_string(), body));
    }

    let zipped = tokio::task::spawn_blocking(move || write_zip(&entries))
        .await
        .map_err(|e| Error::Internal(format!("export task failed: {}", e)))??;
    Ok(Bytes::from(zipped))
}

fn write_zip(entries: &[(String, Bytes)]) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (path, body) in entries {
            zip.start_file(path.as_str(), options)
                .map_err(|e| Error::Internal(format!("failed to add '{}' to archive: {}", path, e)))?;
            zip.write_all(body)?;
        }
        zip.finish()
            .map_err(|e| Error::Internal(format!("failed to finalize archive: {}", e)))?;
    }
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("web-1"), "web-1.zip");
    }

    #[test]
    fn test_exported_entries() {
        assert!(is_exported("app.py"));
        assert!(is_exported("src/main.c"));
        assert!(is_exported("cover.png"));
        assert!(!is_exported("chall.yml"));
        assert!(!is_exported("cover_resized.png"));
        assert!(!is_exported("cover_resized.gif"));
        assert!(!is_exported("dist/"));
    }

    #[test]
    fn test_write_zip_round_trip() {
        let bytes = write_zip(&[
            ("chall.yml".to_string(), Bytes::from_static(b"name: Web\n")),
            ("src/app.py".to_string(), Bytes::from_static(b"print(1)\n")),
        ])
        .unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["chall.yml", "src/app.py"]);

        let mut yaml = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("chall.yml").unwrap(), &mut yaml).unwrap();
        assert_eq!(yaml, "name: Web\n");
    }
}
