//! Represents a permanent catalog entry for one hosted media object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A media resource in the local catalog.
///
/// The row is inserted as a placeholder when an upload session is created and gains
/// its `provider_object_ref` exactly once, when the upload is finalized. The upload
/// engine never touches it afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaResource {
    /// Same value as the id of the upload session that created it.
    pub id: Uuid,

    /// Display name chosen by the user.
    pub name: String,

    /// Identifier assigned by the hosting provider to the assembled object.
    pub provider_object_ref: Option<String>,

    /// When the placeholder was created.
    pub created_at: DateTime<Utc>,

    /// Last time the row was written.
    pub modified_at: DateTime<Utc>,
}

impl MediaResource {
    pub fn is_placeholder(&self) -> bool {
        self.provider_object_ref.is_none()
    }
}

/// Metadata declared by the user when requesting an upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl ResourceMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Title sent to the provider; falls back to the resource name.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.name)
    }
}
