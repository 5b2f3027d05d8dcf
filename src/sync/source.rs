//! Source descriptors and the snapshot the controller reconciles against

use crate::types::{ProfileId, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Kind of an input source attached to a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    VideoDevice,
    CaptureDevice,
    ScreenCapture,
    RemoteScene,
    AudioDevice,
    SolidColor,
    Text,
    Browser,
    Image,
    StaticHtml,
    MediaFile,
}

impl SourceKind {
    /// Whether previews of this kind need a live stream from the gateway
    ///
    /// Audio-only devices, client-rendered overlays and static files such as
    /// images are rendered without one. Media files play through the gateway.
    pub fn needs_transport(&self) -> bool {
        matches!(
            self,
            SourceKind::VideoDevice
                | SourceKind::CaptureDevice
                | SourceKind::ScreenCapture
                | SourceKind::RemoteScene
                | SourceKind::MediaFile
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::VideoDevice => "video_device",
            SourceKind::CaptureDevice => "capture_device",
            SourceKind::ScreenCapture => "screen_capture",
            SourceKind::RemoteScene => "remote_scene",
            SourceKind::AudioDevice => "audio_device",
            SourceKind::SolidColor => "solid_color",
            SourceKind::Text => "text",
            SourceKind::Browser => "browser",
            SourceKind::Image => "image",
            SourceKind::StaticHtml => "static_html",
            SourceKind::MediaFile => "media_file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "video_device" | "video" | "camera" => SourceKind::VideoDevice,
            "capture_device" | "capture" => SourceKind::CaptureDevice,
            "screen_capture" | "screen" | "display" => SourceKind::ScreenCapture,
            "remote_scene" | "remote" => SourceKind::RemoteScene,
            "audio_device" | "audio" => SourceKind::AudioDevice,
            "solid_color" | "color" => SourceKind::SolidColor,
            "text" => SourceKind::Text,
            "browser" | "web" => SourceKind::Browser,
            "image" => SourceKind::Image,
            "static_html" | "html" => SourceKind::StaticHtml,
            "media_file" | "media" | "file" => SourceKind::MediaFile,
            other => return Err(format!("unknown source kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// A source attached to the active profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: SourceId,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<SourceId>, kind: SourceKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// Declared input for reconciliation: active profile plus required sources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub profile: Option<ProfileId>,
    pub required: BTreeSet<SourceId>,
}

impl SyncSnapshot {
    pub fn new(profile: Option<ProfileId>, required: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            profile,
            required: required.into_iter().collect(),
        }
    }

    /// Keep the sources that need a transport, deduplicated
    pub fn from_sources<'a>(
        profile: Option<ProfileId>,
        sources: impl IntoIterator<Item = &'a SourceDescriptor>,
    ) -> Self {
        let required = sources
            .into_iter()
            .filter(|source| source.kind.needs_transport())
            .map(|source| source.id.clone());
        Self::new(profile, required)
    }

    /// No active profile
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_required(&self, source: &SourceId) -> bool {
        self.required.contains(source)
    }
}
