use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};

use crate::affine::{AffineMapper, Geometry};
use crate::batch::{BatchReport, NoProgress, ProgressSink};
use crate::database::{Database, Job, Transfer};
use crate::error::{IndexError, Result};
use crate::metadata_index::IdPath;
use crate::series::Series;
use crate::store::FileStore;
use crate::tag::Tag;

/// Handle on a single image file. The path is its identity; the IDs and
/// UIDs above it are a snapshot taken when the handle was resolved.
///
/// An image made with [`Image::new_sibling`] has no path yet, only the
/// reference file it will be cloned from on [`Image::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    subject_id: String,
    study_id: String,
    series_id: String,
    path: Option<PathBuf>,
    series_uid: String,
    study_uid: String,
    suffix: String,
    reference_path: Option<PathBuf>,
}

impl Image {
    /// Handle for the indexed image at `path`, or `None` on a miss.
    pub fn resolve<S: FileStore>(db: &Database<S>, path: &Path) -> Option<Image> {
        let series = db.index().series_of(path)?;
        let uid = |path: Option<IdPath>| {
            path.and_then(|p| db.index().node_at(&p).map(|node| node.uid().to_string()))
                .unwrap_or_default()
        };
        Some(Image {
            subject_id: series.subject_id().to_string(),
            study_id: series.study_id().unwrap_or_default().to_string(),
            series_id: series.id().to_string(),
            path: Some(path.to_path_buf()),
            study_uid: uid(series.parent()),
            series_uid: uid(Some(series)),
            suffix: String::new(),
            reference_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn reference_path(&self) -> Option<&Path> {
        self.reference_path.as_deref()
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_deleted(&self) -> bool {
        self.series_id.is_empty()
    }

    pub fn parent(&self) -> Series {
        Series::bound(
            &self.subject_id,
            &self.study_id,
            &self.series_id,
            &self.study_uid,
            &self.series_uid,
        )
    }

    fn live(&self) -> Result<&Path> {
        if self.is_deleted() {
            return Err(IndexError::Deleted);
        }
        self.path.as_deref().ok_or(IndexError::Unbound)
    }

    /// An unbound image in the same series, to be cloned from this one.
    pub fn new_sibling(&self, suffix: &str) -> Result<Image> {
        if self.is_deleted() {
            return Err(IndexError::Deleted);
        }
        let reference_path = self
            .path
            .clone()
            .or_else(|| self.reference_path.clone())
            .ok_or(IndexError::Unbound)?;
        Ok(Image {
            path: None,
            suffix: suffix.to_string(),
            reference_path: Some(reference_path),
            ..self.clone()
        })
    }

    /// Bind an unbound image by cloning its reference file and writing
    /// `pixels` into the clone. A bound image just gets new pixels.
    pub fn write<S: FileStore>(&mut self, db: &mut Database<S>, pixels: &Array2<f32>) -> Result<()> {
        if self.is_deleted() {
            return Err(IndexError::Deleted);
        }
        if let Some(path) = &self.path {
            return db.store().write_pixel_array(path, pixels);
        }
        let reference = self.reference_path.clone().ok_or(IndexError::Unbound)?;
        let overrides = self.parent().target().overrides();
        let path = Series::write_clone(db, &reference, &overrides, &self.suffix, pixels)?;
        self.path = Some(path);
        Ok(())
    }

    /// Copy the file into `new_parent`, or into its own series when `None`.
    /// The copy gets a new SOPInstanceUID and a suffixed file name.
    pub fn copy<S: FileStore>(&self, db: &mut Database<S>, suffix: &str, new_parent: Option<&Series>) -> Result<Image> {
        let source = self.live()?.to_path_buf();
        let parent = match new_parent {
            Some(parent) => {
                parent.live()?;
                parent.clone()
            }
            None => self.parent(),
        };
        let job = Job {
            source,
            overrides: parent.target().overrides(),
        };
        let mut report = db.transfer(vec![job], Transfer::Copy, suffix, &mut NoProgress);
        let path = Self::single(&mut report)?;
        let mut copy = Image::resolve(db, &path).ok_or_else(|| IndexError::NotFound(path.display().to_string()))?;
        copy.suffix = suffix.to_string();
        Ok(copy)
    }

    pub fn delete<S: FileStore>(&mut self, db: &mut Database<S>) -> Result<()> {
        let path = self.live()?.to_path_buf();
        let mut report = db.delete_files(vec![path], &mut NoProgress);
        Self::single(&mut report)?;
        *self = Image {
            subject_id: String::new(),
            study_id: String::new(),
            series_id: String::new(),
            path: None,
            series_uid: String::new(),
            study_uid: String::new(),
            suffix: String::new(),
            reference_path: None,
        };
        Ok(())
    }

    /// Copy `images` into one new series called `name`, next to the series
    /// of the first image. See [`Series::merge`] for how `name` is read.
    pub fn merge<S: FileStore>(
        db: &mut Database<S>,
        images: &[Image],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        Self::merge_with(db, images, name, Transfer::Copy, progress)
    }

    /// Like [`Image::merge`] but re-tags the files in place. Irreversible.
    pub fn merge_move<S: FileStore>(
        db: &mut Database<S>,
        images: &[Image],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        Self::merge_with(db, images, name, Transfer::Move, progress)
    }

    fn merge_with<S: FileStore>(
        db: &mut Database<S>,
        images: &[Image],
        name: &str,
        mode: Transfer,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        let sources = images
            .iter()
            .map(|image| image.live().map(Path::to_path_buf))
            .collect::<Result<Vec<_>>>()?;
        let Some(first) = images.first() else {
            return Err(IndexError::NotFound("no images to merge".to_string()));
        };
        let merged = Series::merge_target(db, &first.parent(), name)?;
        let overrides = merged.target().overrides();
        let jobs = sources
            .into_iter()
            .map(|source| Job {
                source,
                overrides: overrides.clone(),
            })
            .collect();
        let suffix = db.config().collision_suffix.clone();
        let type_id = match mode {
            Transfer::Copy => suffix.as_str(),
            Transfer::Move => "",
        };
        let report = db.transfer(jobs, mode, type_id, progress);
        Ok((merged, report))
    }

    pub fn get_value<S: FileStore>(&self, db: &Database<S>, tag: Tag) -> Result<Option<String>> {
        db.store().read_tag(self.live()?, tag)
    }

    /// Write `tag` into the file. An ID-defining tag re-keys the image in
    /// the index and this handle is resolved again at its new place.
    pub fn set_value<S: FileStore>(&mut self, db: &mut Database<S>, tag: Tag, value: &str) -> Result<()> {
        let path = self.live()?.to_path_buf();
        let mut report = db.write_tag_files(vec![path.clone()], tag, value, &mut NoProgress);
        Self::single(&mut report)?;
        if let Some(resolved) = Image::resolve(db, &path) {
            *self = Image {
                suffix: std::mem::take(&mut self.suffix),
                ..resolved
            };
        }
        Ok(())
    }

    pub fn read_pixels<S: FileStore>(&self, db: &Database<S>) -> Result<Array2<f32>> {
        db.store().read_pixel_array(self.live()?)
    }

    pub fn write_pixels<S: FileStore>(&self, db: &Database<S>, pixels: &Array2<f32>) -> Result<()> {
        db.store().write_pixel_array(self.live()?, pixels)
    }

    pub fn geometry<S: FileStore>(&self, db: &Database<S>) -> Result<Geometry> {
        Geometry::from_dataset(&db.store().read_tags(self.live()?)?)
    }

    /// Map `mask`, drawn on this image, onto the pixel grid of `target`.
    ///
    /// # Errors
    ///
    /// `GeometryMissing` when either image lacks geometry tags. An `Ok`
    /// empty list means nothing landed in the target plane.
    pub fn map_mask_to<S: FileStore>(
        &self,
        db: &Database<S>,
        mask: ArrayView2<'_, bool>,
        target: &Image,
    ) -> Result<Vec<(i64, i64)>> {
        AffineMapper::map_mask(mask, &self.geometry(db)?, &target.geometry(db)?)
    }

    /// The one outcome of a single-item batch.
    fn single(report: &mut BatchReport) -> Result<PathBuf> {
        if let Some((_, error)) = report.failed.pop() {
            return Err(error);
        }
        report.succeeded.pop().ok_or(IndexError::Unbound)
    }
}
