// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Process-wide image cache.
//!
//! Images are pulled and unpacked lazily on first use and kept for the
//! lifetime of the process. The cache is append-only; growth is bounded by
//! the number of distinct images deployed.

use dashmap::DashMap;
use url::Url;

use crate::control_plane::{ControlPlane, ImageHandle, PullRequest};
use crate::error::ControlPlaneError;
use crate::types::ImageName;

/// Registry used when an image name carries no registry host.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Convert an image name to a pullable reference.
///
/// Names without a dot are resolved against Docker Hub, matching the default
/// Kubernetes behaviour.
pub fn image_url(image: &ImageName) -> String {
    if image.as_str().contains('.') {
        image.as_str().to_string()
    } else {
        format!("{}/{}", DEFAULT_REGISTRY, image)
    }
}

/// Whether the registry host of `reference` is in the `.local` domain.
pub fn is_local_domain(reference: &str) -> bool {
    let with_scheme = if reference.contains("://") {
        reference.to_string()
    } else {
        format!("dummy://{}", reference)
    };

    Url::parse(&with_scheme)
        .ok()
        .and_then(|url| {
            url.host_str()
                .and_then(|host| host.rsplit('.').next())
                .map(|tld| tld == "local")
        })
        .unwrap_or(false)
}

/// Cache of pulled images keyed by the name callers asked for.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: DashMap<ImageName, ImageHandle>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, image: &ImageName) -> Option<ImageHandle> {
        self.images.get(image).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Return the cached handle or pull the image through `control`.
    ///
    /// Local-domain registries are pulled over plain HTTP; everything else
    /// goes through the default resolver. Failed pulls are not cached.
    pub async fn get_or_pull(
        &self,
        control: &dyn ControlPlane,
        image: &ImageName,
        snapshotter: &str,
    ) -> Result<ImageHandle, ControlPlaneError> {
        if let Some(handle) = self.get(image) {
            return Ok(handle);
        }

        let reference = image_url(image);
        let plain_http = is_local_domain(&reference);
        tracing::debug!(image = %image, reference = %reference, plain_http, "Pulling image");

        let handle = control
            .pull_image(PullRequest {
                reference,
                snapshotter: snapshotter.to_string(),
                plain_http,
            })
            .await?;

        // Concurrent pulls of the same name race benignly; first insert wins.
        Ok(self
            .images
            .entry(image.clone())
            .or_insert(handle)
            .value()
            .clone())
    }
}
