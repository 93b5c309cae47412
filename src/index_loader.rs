use std::ffi::OsString;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::IndexConfig;
use crate::error::{IndexError, Result};
use crate::metadata_index::{ImageRecord, MetadataIndex};
use crate::store::FileStore;
use crate::tag::TagSet;

pub struct IndexLoader;

impl IndexLoader {
    /// Load the index persisted next to `folder`, or build it by scanning
    /// the folder when the document is missing or unreadable.
    ///
    /// The document lives at `<folder>.xml`.
    ///
    /// # Errors
    ///
    /// Only scanning errors are returned; a broken document falls back to a
    /// rescan.
    pub fn open<S: FileStore + Sync>(folder: &Path, store: &S, config: &IndexConfig) -> Result<MetadataIndex> {
        let location = Self::index_location(folder);
        match MetadataIndex::load(&location) {
            Ok(index) => {
                info!(
                    location = %location.display(),
                    images = index.image_count(),
                    "loaded index"
                );
                Ok(index)
            }
            Err(error @ (IndexError::Io(_) | IndexError::Parse(_))) => {
                warn!(location = %location.display(), %error, "index unusable, rescanning");
                Self::scan(folder, store, config)
            }
            Err(error) => Err(error),
        }
    }

    /// Build a fresh index from every accepted file below `folder`.
    ///
    /// Files whose tags cannot be read are skipped. Images are filed in path
    /// order so repeated scans produce the same tree.
    pub fn scan<S: FileStore + Sync>(folder: &Path, store: &S, config: &IndexConfig) -> Result<MetadataIndex> {
        if !folder.is_dir() {
            return Err(IndexError::NotFound(folder.display().to_string()));
        }
        let paths: Vec<PathBuf> = WalkDir::new(folder)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    debug!(%error, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| config.accepts(path))
            .collect();

        let mut tagged: Vec<(PathBuf, TagSet)> = if config.parallel_scan {
            paths
                .into_par_iter()
                .filter_map(|path| Self::read(store, path))
                .collect()
        } else {
            paths
                .into_iter()
                .filter_map(|path| Self::read(store, path))
                .collect()
        };
        tagged.sort_by(|a, b| a.0.cmp(&b.0));

        let mut index = MetadataIndex::new(Self::index_location(folder));
        index.set_collision_suffix(config.collision_suffix.as_str());
        for (path, tags) in &tagged {
            index.insert_image(ImageRecord::from_tags(path, tags, ""));
        }
        info!(
            folder = %folder.display(),
            images = index.image_count(),
            "scanned folder"
        );
        Ok(index)
    }

    /// `<folder>.xml`, a sibling of the folder rather than a file inside it.
    pub fn index_location(folder: &Path) -> PathBuf {
        let mut location: OsString = folder.as_os_str().to_os_string();
        location.push(".xml");
        PathBuf::from(location)
    }

    fn read<S: FileStore>(store: &S, path: PathBuf) -> Option<(PathBuf, TagSet)> {
        match store.read_tags(&path) {
            Ok(tags) => Some((path, tags)),
            Err(error) => {
                debug!(path = %path.display(), %error, "not a readable DICOM file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::metadata_index::IdPath;
    use crate::store::MemoryFileStore;
    use crate::tag::Tag;

    fn tags(patient: &str, series: &str) -> TagSet {
        TagSet::new()
            .with(Tag::PatientID, patient)
            .with(Tag::StudyDate, "20240101")
            .with(Tag::StudyTime, "120000")
            .with(Tag::StudyDescription, "Head")
            .with(Tag::SeriesNumber, "1")
            .with(Tag::SeriesDescription, series)
    }

    /// Real files on disk so the walk finds them; tags come from the
    /// in-memory store.
    fn folder_with(names: &[&str]) -> (tempfile::TempDir, MemoryFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryFileStore::new();
        for name in names {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, b"").unwrap();
            store.insert(&path, tags("P1", "T1"));
        }
        (dir, store)
    }

    #[test]
    fn scan_indexes_accepted_files_recursively() {
        let (dir, store) = folder_with(&["a.dcm", "nested/b.dcm", "c"]);
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let index = IndexLoader::scan(dir.path(), &store, &IndexConfig::default()).unwrap();

        assert_eq!(index.image_count(), 3);
        let series = IdPath::series("P1", "20240101_120000_Head", "1_T1");
        assert_eq!(index.image_paths(&series).len(), 3);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let (dir, store) = folder_with(&["a.dcm"]);
        fs::write(dir.path().join("broken.dcm"), b"").unwrap();

        let config = IndexConfig::default().with_parallel_scan(false);
        let index = IndexLoader::scan(dir.path(), &store, &config).unwrap();
        assert_eq!(index.image_count(), 1);
    }

    #[test]
    fn open_rescans_when_the_document_is_broken() {
        let (dir, store) = folder_with(&["a.dcm", "b.dcm"]);
        let location = IndexLoader::index_location(dir.path());
        fs::write(&location, "<DICOM><subject").unwrap();

        let index = IndexLoader::open(dir.path(), &store, &IndexConfig::default()).unwrap();
        assert_eq!(index.image_count(), 2);
        fs::remove_file(location).unwrap();
    }

    #[test]
    fn open_prefers_the_saved_document() {
        let (dir, store) = folder_with(&["a.dcm"]);
        let index = IndexLoader::scan(dir.path(), &store, &IndexConfig::default()).unwrap();
        index.save().unwrap();

        // A file added after saving is not seen until a rescan.
        let extra = dir.path().join("b.dcm");
        fs::write(&extra, b"").unwrap();
        store.insert(&extra, tags("P2", "T2"));

        let reopened = IndexLoader::open(dir.path(), &store, &IndexConfig::default()).unwrap();
        assert_eq!(reopened.image_count(), 1);
        fs::remove_file(IndexLoader::index_location(dir.path())).unwrap();
    }

    #[test]
    fn same_named_series_with_different_uids_stay_apart() {
        let (dir, store) = folder_with(&["a.dcm", "b.dcm", "c.dcm"]);
        for (name, uid) in [("a.dcm", "1.2.3.1"), ("b.dcm", "1.2.3.1"), ("c.dcm", "1.2.3.99")] {
            let path = dir.path().join(name);
            store.insert(&path, tags("P1", "T1").with(Tag::SeriesInstanceUID, uid));
        }

        let config = IndexConfig::default().with_collision_suffix("_b");
        let index = IndexLoader::scan(dir.path(), &store, &config).unwrap();

        let study = IdPath::study("P1", "20240101_120000_Head");
        let first = index.node_at(&IdPath::series("P1", "20240101_120000_Head", "1_T1")).unwrap();
        assert_eq!(first.uid(), "1.2.3.1");
        assert_eq!(first.children().len(), 2);
        let second = index.node_at(&IdPath::series("P1", "20240101_120000_Head", "1_T1_b")).unwrap();
        assert_eq!(second.uid(), "1.2.3.99");
        assert_eq!(index.children(&study).len(), 2);
    }

    #[test]
    fn missing_folder_is_not_found() {
        let store = MemoryFileStore::new();
        let result = IndexLoader::scan(Path::new("/does/not/exist"), &store, &IndexConfig::default());
        assert!(matches!(result, Err(IndexError::NotFound(_))));
    }
}
