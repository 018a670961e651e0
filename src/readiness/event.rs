//! Load lifecycle events emitted by the rendering engine.

use serde::{Deserialize, Serialize};

use crate::identifiers::FrameId;

// ============================================================================
// LoadEvent
// ============================================================================

/// A low-level load or resource event.
///
/// The engine reports these from whatever thread it runs its network and
/// loader callbacks on; the readiness monitor turns them into a single
/// navigation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LoadEvent {
    /// A frame started navigating to `url`.
    NavigationStarted {
        /// Navigating frame.
        frame: FrameId,
        /// Target URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },

    /// A frame navigation was redirected to `url`.
    Redirected {
        /// Navigating frame.
        frame: FrameId,
        /// New target URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },

    /// The document for `url` became available to the frame.
    DocumentAvailable {
        /// Frame owning the document.
        frame: FrameId,
        /// Document URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },

    /// A subresource started loading.
    ResourceStarted {
        /// Requesting frame.
        frame: FrameId,
        /// Resource URL.
        url: String,
    },

    /// A subresource finished loading.
    ResourceFinished {
        /// Requesting frame.
        frame: FrameId,
        /// Resource URL.
        url: String,
    },

    /// A subresource failed to load.
    ResourceFailed {
        /// Requesting frame.
        frame: FrameId,
        /// Resource URL.
        url: String,
    },

    /// A frame finished loading its page.
    PageFinished {
        /// Frame that finished.
        frame: FrameId,
        /// Page URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },

    /// A frame load was stopped.
    LoadStopped {
        /// Frame that stopped.
        frame: FrameId,
        /// Page URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },

    /// A frame load failed.
    LoadFailed {
        /// Frame that failed.
        frame: FrameId,
        /// Page URL.
        url: String,
        /// Whether the frame is the top-level frame.
        main_frame: bool,
    },
}

impl LoadEvent {
    /// Returns the frame the event belongs to.
    #[must_use]
    pub fn frame(&self) -> FrameId {
        match self {
            Self::NavigationStarted { frame, .. }
            | Self::Redirected { frame, .. }
            | Self::DocumentAvailable { frame, .. }
            | Self::ResourceStarted { frame, .. }
            | Self::ResourceFinished { frame, .. }
            | Self::ResourceFailed { frame, .. }
            | Self::PageFinished { frame, .. }
            | Self::LoadStopped { frame, .. }
            | Self::LoadFailed { frame, .. } => *frame,
        }
    }

    /// Returns the URL the event refers to.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::NavigationStarted { url, .. }
            | Self::Redirected { url, .. }
            | Self::DocumentAvailable { url, .. }
            | Self::ResourceStarted { url, .. }
            | Self::ResourceFinished { url, .. }
            | Self::ResourceFailed { url, .. }
            | Self::PageFinished { url, .. }
            | Self::LoadStopped { url, .. }
            | Self::LoadFailed { url, .. } => url,
        }
    }
}
