// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `chall.yml` descriptor.
//!
//! The YAML shape authors write, its validation, and the conversion into the
//! [`ChallengeSync`] the store reconciles. Plaintext flags never leave this
//! module: [`Descriptor::into_sync`] hashes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flag;
use crate::geo;
use crate::models::{ChallengeSync, ChallengeType, GeoSpec, NewHint};

/// Descriptor file name inside a challenge prefix.
pub const DESCRIPTOR_FILE: &str = "chall.yml";

/// Placeholder written instead of flags on export.
pub const REDACTED: &str = "REDACTED";

/// Errors from parsing or validating a descriptor.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum DescriptorError {
    /// Not valid YAML, or wrong field types.
    #[error("invalid chall.yml: {0}")]
    Yaml(String),

    /// `name` absent or blank.
    #[error("chall.yml: name is required")]
    MissingName,

    /// Field present but unacceptable.
    #[error("chall.yml: {0}")]
    Invalid(String),

    /// Directory name is not a slug.
    #[error("'{0}' is not a valid challenge slug")]
    InvalidSlug(String),
}

/// A hint as written in `chall.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorHint {
    /// Title shown before purchase.
    #[serde(default)]
    pub title: String,
    /// Revealed text.
    #[serde(default)]
    pub content: String,
    /// Price in points.
    #[serde(default)]
    pub cost: i32,
    /// Defaults to active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// RFC 3339 activation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_active_at: Option<String>,
}

/// First-blood bonuses and badges by position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstBloodSpec {
    /// Bonus per solve position.
    #[serde(default)]
    pub bonuses: Vec<i32>,
    /// Badge per solve position.
    #[serde(default)]
    pub badges: Vec<String>,
}

/// Parsed `chall.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Display name; required.
    #[serde(default)]
    pub name: String,
    /// Markdown body.
    #[serde(default)]
    pub description: String,
    /// Category label.
    #[serde(default)]
    pub category: String,
    /// Difficulty label.
    #[serde(default)]
    pub difficulty: String,
    /// `standard`, `docker`, `compose` or `geo`.
    #[serde(default, rename = "type")]
    pub challenge_type: String,
    /// Decay formula name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<String>,
    /// Author credit.
    #[serde(default)]
    pub author: String,
    /// Hide from non-admins.
    #[serde(default)]
    pub hidden: bool,
    /// Base points.
    #[serde(default)]
    pub points: i32,
    /// Wrong answers allowed per team; 0 is unlimited.
    #[serde(default)]
    pub attempts: i32,
    /// Container ports to expose.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
    /// Connection templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_info: Vec<String>,
    /// Cover image file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_img: Option<String>,
    /// Downloadable file names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Plaintext answers.
    #[serde(default)]
    pub flags: Vec<String>,
    /// Hints in display order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<DescriptorHint>,
    /// Positional bonuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_blood: Option<FirstBloodSpec>,
    /// Overrides whether bonuses apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_first_blood: Option<bool>,
    /// Name of a prerequisite challenge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    /// Emoji shown next to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    /// Target latitude for `geo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lat: Option<f64>,
    /// Target longitude for `geo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lng: Option<f64>,
    /// Accepted radius for `geo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
}

impl Descriptor {
    /// Parse and validate YAML.
    pub fn parse(yaml: &str) -> Result<Self, DescriptorError> {
        let descriptor: Descriptor =
            serde_yaml::from_str(yaml).map_err(|e| DescriptorError::Yaml(e.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String, DescriptorError> {
        serde_yaml::to_string(self).map_err(|e| DescriptorError::Yaml(e.to_string()))
    }

    /// Check every field that can be checked without the object store.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::MissingName);
        }
        let kind = self.kind()?;

        if self.points < 0 {
            return Err(DescriptorError::Invalid("points must be >= 0".into()));
        }
        if self.attempts < 0 {
            return Err(DescriptorError::Invalid("attempts must be >= 0".into()));
        }
        if let Some(port) = self.ports.iter().find(|p| !(1..=65535).contains(*p)) {
            return Err(DescriptorError::Invalid(format!("port {} out of range", port)));
        }
        for name in self.files.iter().chain(self.cover_img.iter()) {
            if !is_safe_relative_path(name) {
                return Err(DescriptorError::Invalid(format!("unsafe file path '{}'", name)));
            }
        }
        if let Some(fb) = &self.first_blood
            && self.first_blood_enabled()
        {
            if !fb.badges.is_empty() && fb.badges.len() != fb.bonuses.len() {
                return Err(DescriptorError::Invalid(
                    "first_blood bonuses and badges must have the same length".into(),
                ));
            }
            if fb.bonuses.iter().any(|b| *b < 0) {
                return Err(DescriptorError::Invalid("first_blood bonuses must be >= 0".into()));
            }
        }
        for hint in &self.hints {
            if hint.cost < 0 {
                return Err(DescriptorError::Invalid("hint cost must be >= 0".into()));
            }
        }

        if kind == ChallengeType::Geo {
            self.geo_spec()?;
        }
        if kind.supports_instances() && self.ports.is_empty() {
            return Err(DescriptorError::Invalid(format!(
                "{} challenges must declare ports",
                kind
            )));
        }
        Ok(())
    }

    /// Challenge type.
    pub fn kind(&self) -> Result<ChallengeType, DescriptorError> {
        self.challenge_type
            .parse()
            .map_err(DescriptorError::Invalid)
    }

    /// Decay formula named by the author, if any.
    pub fn decay_name(&self) -> Option<&str> {
        match self.decay.as_deref().map(str::trim) {
            None | Some("") | Some("None") => None,
            Some(name) => Some(name),
        }
    }

    /// First blood is on when bonuses are listed or the flag says so.
    pub fn first_blood_enabled(&self) -> bool {
        self.enable_first_blood.unwrap_or(false)
            || self.first_blood.as_ref().is_some_and(|fb| !fb.bonuses.is_empty())
    }

    /// Target and radius of a geo challenge.
    pub fn geo_spec(&self) -> Result<GeoSpec, DescriptorError> {
        let (Some(lat), Some(lng), Some(radius)) = (self.target_lat, self.target_lng, self.radius_km)
        else {
            return Err(DescriptorError::Invalid(
                "geo challenges need target_lat, target_lng and radius_km".into(),
            ));
        };
        if !geo::is_valid_coordinate(lat, lng) {
            return Err(DescriptorError::Invalid("geo target out of range".into()));
        }
        if radius.is_nan() || radius <= 0.0 {
            return Err(DescriptorError::Invalid("radius_km must be > 0".into()));
        }
        Ok(GeoSpec {
            target_lat: lat,
            target_lng: lng,
            radius_km: radius,
        })
    }

    /// Flags as stored: geo specs verbatim, everything else hashed.
    pub fn encoded_flags(&self) -> Vec<String> {
        self.flags
            .iter()
            .map(|f| {
                if flag::decode_geo(f).is_some() {
                    f.clone()
                } else {
                    flag::hash_flag(f)
                }
            })
            .collect()
    }

    /// Hints as stored. Missing `is_active` means active; an unparseable
    /// activation time is dropped.
    pub fn new_hints(&self) -> Vec<NewHint> {
        self.hints
            .iter()
            .map(|h| NewHint {
                title: h.title.clone(),
                content: h.content.clone(),
                cost: h.cost,
                is_active: h.is_active.unwrap_or(true),
                auto_active_at: h
                    .auto_active_at
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
                    .map(|t| t.with_timezone(&Utc)),
            })
            .collect()
    }

    /// Convert into the reconciliation payload for `slug`.
    ///
    /// `decay_formula_id` is the resolved formula to assign, `None` to keep
    /// whatever the challenge has.
    pub fn into_sync(
        self,
        slug: &str,
        decay_formula_id: Option<i32>,
    ) -> Result<ChallengeSync, DescriptorError> {
        let kind = self.kind()?;
        let geo = if kind == ChallengeType::Geo {
            Some(self.geo_spec()?)
        } else {
            None
        };
        let flags = self.encoded_flags();
        let hints = self.new_hints();
        let enable_first_blood = self.first_blood_enabled();
        let fb = self.first_blood.unwrap_or_default();

        Ok(ChallengeSync {
            slug: slug.to_string(),
            name: self.name,
            description: self.description,
            category: self.category,
            difficulty: self.difficulty,
            challenge_type: kind,
            author: self.author,
            hidden: self.hidden,
            points: self.points,
            decay_formula_id,
            enable_first_blood,
            first_blood_bonuses: fb.bonuses,
            first_blood_badges: fb.badges,
            ports: self.ports,
            connection_info: self.connection_info,
            max_attempts: self.attempts,
            depends_on: self.depends_on.filter(|d| !d.trim().is_empty()),
            files: self.files,
            cover_img: self.cover_img.filter(|c| !c.trim().is_empty()),
            emoji: self.emoji,
            flags,
            hints,
            geo,
        })
    }
}

/// Relative path that stays inside its prefix.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path.split('/').all(|seg| !seg.is_empty() && seg != ".." && seg != ".")
}

/// Slug and path of a descriptor key, or `None` if the key is not a descriptor.
///
/// Accepts keys with or without a leading bucket name
/// (`challenges/web/chall.yml`, `challenge-files/web/chall.yml`, `web/chall.yml`).
pub fn descriptor_slug(key: &str) -> Option<&str> {
    let key = key.trim_start_matches('/');
    let key = ["challenges/", "challenge-files/"]
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key);
    let (slug, rest) = key.split_once('/')?;
    if rest != DESCRIPTOR_FILE || slug.is_empty() {
        return None;
    }
    Some(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_YAML: &str = r#"
name: Baby Web
description: Find the flag
category: web
difficulty: easy
type: docker
decay: Logarithmic - Medium
author: alice
points: 500
attempts: 5
ports: [80]
connection_info:
  - "http://$ip:[80]"
files: [app.py]
flags: ["FLAG{one}", "FLAG{two}"]
hints:
  - title: Look closer
    content: Check the cookies
    cost: 50
  - title: Later
    content: Scheduled
    cost: 0
    is_active: false
    auto_active_at: "2025-06-01T12:00:00Z"
first_blood:
  bonuses: [100, 50, 25]
  badges: [gold, silver, bronze]
"#;

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn test_parse_docker_descriptor() {
        let d = Descriptor::parse(DOCKER_YAML).unwrap();
        assert_eq!(d.kind().unwrap(), ChallengeType::Docker);
        assert_eq!(d.decay_name(), Some("Logarithmic - Medium"));
        assert!(d.first_blood_enabled());

        let sync = d.into_sync("baby-web", Some(5)).unwrap();
        assert_eq!(sync.slug, "baby-web");
        assert_eq!(sync.max_attempts, 5);
        assert_eq!(sync.first_blood_bonuses, vec![100, 50, 25]);
        assert_eq!(sync.flags.len(), 2);
        assert!(sync.flags.iter().all(|f| f.len() == 64 && !f.contains("FLAG")));
        assert!(sync.hints[0].is_active);
        assert!(!sync.hints[1].is_active);
        assert!(sync.hints[1].auto_active_at.is_some());
    }

    #[test]
    fn test_name_required() {
        assert_eq!(
            Descriptor::parse("points: 10").unwrap_err(),
            DescriptorError::MissingName
        );
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            Descriptor::parse("name: [unclosed"),
            Err(DescriptorError::Yaml(_))
        ));
        assert!(matches!(
            Descriptor::parse("name: x\npoints: lots"),
            Err(DescriptorError::Yaml(_))
        ));
    }

    #[test]
    fn test_decay_none_means_unspecified() {
        let d = Descriptor::parse("name: x\ndecay: None").unwrap();
        assert_eq!(d.decay_name(), None);
        let d = Descriptor::parse("name: x\ndecay: ''").unwrap();
        assert_eq!(d.decay_name(), None);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_rejects_traversal_in_files() {
        let err = Descriptor::parse("name: x\nfiles: ['../secret']").unwrap_err();
        assert!(matches!(err, DescriptorError::Invalid(_)));
        let err = Descriptor::parse("name: x\ncover_img: /etc/passwd").unwrap_err();
        assert!(matches!(err, DescriptorError::Invalid(_)));
    }

    #[test]
    fn test_first_blood_length_mismatch() {
        let yaml = "name: x\nfirst_blood:\n  bonuses: [10, 5]\n  badges: [gold]\n";
        assert!(matches!(
            Descriptor::parse(yaml),
            Err(DescriptorError::Invalid(_))
        ));
        // Badges may be omitted entirely
        let yaml = "name: x\nfirst_blood:\n  bonuses: [10, 5]\n";
        assert!(Descriptor::parse(yaml).is_ok());
    }

    #[test]
    fn test_instance_types_need_ports() {
        assert!(Descriptor::parse("name: x\ntype: compose").is_err());
        assert!(Descriptor::parse("name: x\ntype: compose\nports: [1337]").is_ok());
        assert!(Descriptor::parse("name: x\ntype: docker\nports: [0]").is_err());
    }

    #[test]
    fn test_geo_descriptor() {
        let yaml = "name: Where\ntype: geo\ntarget_lat: 48.8566\ntarget_lng: 2.3522\nradius_km: 1\n";
        let d = Descriptor::parse(yaml).unwrap();
        let sync = d.into_sync("where", None).unwrap();
        assert_eq!(sync.geo.unwrap().radius_km, 1.0);

        assert!(Descriptor::parse("name: x\ntype: geo\ntarget_lat: 95\ntarget_lng: 0\nradius_km: 1").is_err());
        assert!(Descriptor::parse("name: x\ntype: geo\ntarget_lat: 1\ntarget_lng: 0\nradius_km: 0").is_err());
        assert!(Descriptor::parse("name: x\ntype: geo").is_err());
    }

    #[test]
    fn test_geo_flags_kept_verbatim() {
        let d = Descriptor::parse("name: x\nflags: ['geo:1.5,2.5,0.3', 'plain']").unwrap();
        let flags = d.encoded_flags();
        assert_eq!(flags[0], "geo:1.5,2.5,0.3");
        assert_eq!(flags[1], crate::flag::hash_flag("plain"));
    }

    #[test]
    fn test_bad_auto_activation_ignored() {
        let yaml = "name: x\nhints:\n  - title: t\n    content: c\n    auto_active_at: tomorrow\n";
        let hints = Descriptor::parse(yaml).unwrap().new_hints();
        assert_eq!(hints[0].auto_active_at, None);
        assert!(hints[0].is_active);
    }

    // ========================================================================
    // Keys
    // ========================================================================

    #[test]
    fn test_descriptor_slug() {
        assert_eq!(descriptor_slug("web/chall.yml"), Some("web"));
        assert_eq!(descriptor_slug("challenges/web/chall.yml"), Some("web"));
        assert_eq!(descriptor_slug("challenge-files/web/chall.yml"), Some("web"));
        assert_eq!(descriptor_slug("web/sub/chall.yml"), None);
        assert_eq!(descriptor_slug("web/app.py"), None);
        assert_eq!(descriptor_slug("chall.yml"), None);
    }
}
