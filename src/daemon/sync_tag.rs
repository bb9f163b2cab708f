//! Sync tag bookkeeping
//!
//! The sync tag marks the revision that was last applied. Sync attempts read
//! the tag before moving it and report both ends of the move here, which lets
//! the tracker notice when something other than this daemon moved the tag in
//! between. That usually means two daemons share one tag and are overwriting
//! each other's progress marker.

/// Last known state of the sync tag
#[derive(Debug, Clone)]
pub struct SyncTagTracker {
    sync_tag: String,
    revision: String,
    warned_about_change: bool,
}

impl SyncTagTracker {
    /// Create a tracker for a tag that has not been written yet
    pub fn new(sync_tag: impl Into<String>) -> Self {
        Self {
            sync_tag: sync_tag.into(),
            revision: String::new(),
            warned_about_change: false,
        }
    }

    /// Name of the tag being tracked
    pub fn sync_tag(&self) -> &str {
        &self.sync_tag
    }

    /// Last revision this tracker saw written to the tag; empty if none
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Whether the external-change warning has been raised
    pub fn warned_about_change(&self) -> bool {
        self.warned_about_change
    }

    /// Record that the tag moved from `old_rev` to `new_rev`
    ///
    /// If a revision was recorded before and `old_rev` is not it, someone
    /// else moved the tag; that is warned about once per tracker. Returns
    /// `true` if this call raised the warning.
    pub fn set_revision(&mut self, old_rev: &str, new_rev: &str) -> bool {
        let external = !self.revision.is_empty() && old_rev != self.revision;
        let warn = external && !self.warned_about_change;
        if warn {
            tracing::warn!(
                tag = %self.sync_tag,
                expected = %self.revision,
                found = %old_rev,
                "Detected external change in git sync tag; the sync tag should not be shared by daemon instances"
            );
            self.warned_about_change = true;
        }

        tracing::info!(tag = %self.sync_tag, old = %old_rev, new = %new_rev, "Sync tag moved");
        self.revision = new_rev.to_string();
        warn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_never_warns() {
        let mut tracker = SyncTagTracker::new("reconciler-sync");
        assert!(!tracker.set_revision("", "abc"));
        assert_eq!(tracker.revision(), "abc");
        assert!(!tracker.warned_about_change());
    }

    #[test]
    fn test_first_write_with_unexpected_old_does_not_warn() {
        // Nothing recorded yet, so there is nothing to compare against
        let mut tracker = SyncTagTracker::new("reconciler-sync");
        assert!(!tracker.set_revision("zzz", "abc"));
    }

    #[test]
    fn test_external_change_warns_once() {
        let mut tracker = SyncTagTracker::new("reconciler-sync");

        assert!(!tracker.set_revision("", "abc"));
        assert_eq!(tracker.revision(), "abc");

        assert!(tracker.set_revision("xyz", "def"));
        assert_eq!(tracker.revision(), "def");
        assert!(tracker.warned_about_change());

        assert!(!tracker.set_revision("def", "ghi"));
        assert_eq!(tracker.revision(), "ghi");
    }

    #[test]
    fn test_warning_is_sticky() {
        let mut tracker = SyncTagTracker::new("reconciler-sync");
        tracker.set_revision("", "a");

        let warnings = [("x", "b"), ("y", "c"), ("z", "d"), ("d", "e")]
            .iter()
            .filter(|(old, new)| tracker.set_revision(old, new))
            .count();

        assert_eq!(warnings, 1);
        assert!(tracker.warned_about_change());
        assert_eq!(tracker.revision(), "e");
    }
}
