//! Spill directory lifecycle.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::spill::{SegmentWriter, Side, SpillCodec, SpillDirectory, SpillOptions};

    /// # Scenario
    /// A directory that is never asked for a path.
    ///
    /// # Expected behavior
    /// Nothing is created on disk.
    #[test]
    fn directory_is_created_lazily() {
        let tmp = TempDir::new().unwrap();
        let dir = SpillDirectory::new(tmp.path());
        assert!(dir.path().is_none());
        drop(dir);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    /// # Scenario
    /// Two joins spill under the same root.
    ///
    /// # Expected behavior
    /// - Each gets its own subdirectory and unique file names.
    /// - `remove_all` deletes a directory with its leftover files, and a
    ///   second call is harmless.
    #[test]
    fn directories_are_private_and_removable() {
        let tmp = TempDir::new().unwrap();
        let mut a = SpillDirectory::new(tmp.path());
        let mut b = SpillDirectory::new(tmp.path());

        let pa1 = a.next_segment_path(0, 3, Side::Build).unwrap();
        let pa2 = a.next_segment_path(0, 3, Side::Build).unwrap();
        let pb = b.next_segment_path(0, 3, Side::Build).unwrap();
        assert_ne!(pa1, pa2);
        assert_ne!(a.path(), b.path());
        assert!(pa1.starts_with(a.path().unwrap()));
        assert!(pb.starts_with(b.path().unwrap()));

        let opts = SpillOptions {
            codec: SpillCodec::None,
            block_size: 1024,
            async_io: false,
        };
        let writer = SegmentWriter::create(&pa1, &opts, 1024).unwrap();
        let segment = writer.close().unwrap();
        // Leak the file into the directory so remove_all must clean it.
        std::mem::forget(segment);

        let a_path = a.path().unwrap().to_path_buf();
        a.remove_all();
        assert!(!a_path.exists());
        a.remove_all();

        let b_path = b.path().unwrap().to_path_buf();
        drop(b);
        assert!(!b_path.exists());
    }
}
