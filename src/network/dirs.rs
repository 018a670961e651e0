//! Process-scoped download directories.

use std::path::Path;

use tempfile::TempDir;
use tracing::debug;

use crate::error::Result;

/// Temporary directories for saved attachments and media.
///
/// Both directories are removed when the value is dropped.
#[derive(Debug)]
pub struct DownloadDirs {
    attachments: TempDir,
    media: TempDir,
}

impl DownloadDirs {
    /// Creates both directories under the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if a directory cannot be created.
    pub fn create() -> Result<Self> {
        let attachments = tempfile::Builder::new().prefix("attachments").tempdir()?;
        let media = tempfile::Builder::new().prefix("media").tempdir()?;

        debug!(
            attachments = %attachments.path().display(),
            media = %media.path().display(),
            "Download directories created"
        );

        Ok(Self { attachments, media })
    }

    /// Directory for bodies served with `Content-Disposition: attachment`.
    #[inline]
    #[must_use]
    pub fn attachments(&self) -> &Path {
        self.attachments.path()
    }

    /// Directory for media bodies.
    #[inline]
    #[must_use]
    pub fn media(&self) -> &Path {
        self.media.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directories_removed_on_drop() {
        let dirs = DownloadDirs::create().expect("dirs");
        let attachments = dirs.attachments().to_path_buf();
        assert!(attachments.is_dir());
        assert_ne!(dirs.attachments(), dirs.media());

        drop(dirs);
        assert!(!attachments.exists());
    }
}
