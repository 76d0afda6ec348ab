// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cover image derivative.
//!
//! Accepts JPEG, PNG, GIF and WebP up to 5 MiB and 8000 x 8000. GIFs are
//! stored untouched so animation survives; everything else is re-encoded to
//! PNG. The result lands at `<slug>/cover_resized.<ext>`.

use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use image::{ImageFormat, ImageReader};
use thiserror::Error;

use crate::object_store::{Bucket, ObjectStore, ObjectStoreError, get_bytes};

/// Largest accepted source image.
pub const MAX_COVER_BYTES: u64 = 5 * 1024 * 1024;

/// Largest accepted width or height.
pub const MAX_COVER_DIMENSION: u32 = 8000;

/// Basename of the derivative, without extension.
pub const RESIZED_STEM: &str = "cover_resized";

const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a cover was not processed.
#[derive(Debug, Error)]
pub enum CoverError {
    /// Reading the original failed.
    #[error("cover fetch failed: {0}")]
    Fetch(#[from] ObjectStoreError),

    /// Not a PNG, JPEG, GIF or WebP.
    #[error("unsupported cover format")]
    UnsupportedFormat,

    /// Dimensions exceed the limit.
    #[error("cover is {width}x{height}, limit is {MAX_COVER_DIMENSION}x{MAX_COVER_DIMENSION}")]
    TooLarge {
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },

    /// Decoding or encoding failed.
    #[error("cover decode failed: {0}")]
    Image(#[from] image::ImageError),

    /// Processing ran past its deadline.
    #[error("cover processing timed out")]
    Timeout,

    /// The blocking task panicked or was cancelled.
    #[error("cover processing task failed: {0}")]
    Task(String),
}

/// Encoded derivative.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivative {
    /// Encoded image.
    pub bytes: Bytes,
    /// File extension, without the dot.
    pub extension: &'static str,
    /// MIME type.
    pub content_type: &'static str,
}

/// Validate `data` and produce the stored derivative.
pub fn derive(data: &[u8]) -> Result<Derivative, CoverError> {
    let format = image::guess_format(data).map_err(|_| CoverError::UnsupportedFormat)?;
    if !matches!(
        format,
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif | ImageFormat::WebP
    ) {
        return Err(CoverError::UnsupportedFormat);
    }

    let (width, height) = ImageReader::with_format(Cursor::new(data), format).into_dimensions()?;
    if width > MAX_COVER_DIMENSION || height > MAX_COVER_DIMENSION {
        return Err(CoverError::TooLarge { width, height });
    }

    if format == ImageFormat::Gif {
        return Ok(Derivative {
            bytes: Bytes::copy_from_slice(data),
            extension: "gif",
            content_type: "image/gif",
        });
    }

    let decoded = image::load_from_memory_with_format(data, format)?;
    let mut out = Cursor::new(Vec::new());
    decoded.write_to(&mut out, ImageFormat::Png)?;
    Ok(Derivative {
        bytes: Bytes::from(out.into_inner()),
        extension: "png",
        content_type: "image/png",
    })
}

/// Fetch `<slug>/<name>`, derive and store the resized cover. Returns the
/// derivative's file name relative to the slug.
pub async fn process(objects: &dyn ObjectStore, slug: &str, name: &str) -> Result<String, CoverError> {
    let source = get_bytes(
        objects,
        Bucket::Challenges,
        &format!("{}/{}", slug, name),
        MAX_COVER_BYTES,
    )
    .await?;

    let task = tokio::task::spawn_blocking(move || derive(&source));
    let derivative = match tokio::time::timeout(PROCESS_TIMEOUT, task).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(CoverError::Task(e.to_string())),
        Err(_) => return Err(CoverError::Timeout),
    };

    let file = format!("{}.{}", RESIZED_STEM, derivative.extension);
    objects
        .put(
            Bucket::Challenges,
            &format!("{}/{}", slug, file),
            derivative.bytes,
            derivative.content_type,
        )
        .await?;
    Ok(file)
}
