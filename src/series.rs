use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use tracing::warn;

use crate::affine::{AffineMapper, Geometry};
use crate::batch::{BatchReport, NoProgress, ProgressSink, TagValues};
use crate::database::{Database, Job, Target, Transfer, series_parts, series_tags, study_tags};
use crate::enums::SortBy;
use crate::error::{IndexError, Result};
use crate::id_generator::IdGenerator;
use crate::image::Image;
use crate::metadata_index::IdPath;
use crate::store::FileStore;
use crate::study::Study;
use crate::tag::{Dataset, Tag, TagSet};

/// Lifecycle of a series handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    /// Named but without files, as returned by [`Series::new_sibling`].
    Unbound,
    Bound,
    /// Terminal; every ID field has been cleared.
    Deleted,
}

/// Handle on a series, keyed by `<SeriesNumber>_<description>` under its
/// study.
///
/// `reference_paths` are the template files a new series was derived
/// from; [`Series::write`] clones them when the series first gets pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    subject_id: String,
    study_id: String,
    series_id: String,
    study_uid: String,
    series_uid: String,
    suffix: String,
    reference_paths: Vec<PathBuf>,
}

/// Per-image result of mapping one mask onto a whole series.
pub type MappedMasks = Vec<(PathBuf, Result<Vec<(i64, i64)>>)>;

impl Series {
    pub(crate) fn bound(subject_id: &str, study_id: &str, series_id: &str, study_uid: &str, series_uid: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            study_id: study_id.to_string(),
            series_id: series_id.to_string(),
            study_uid: study_uid.to_string(),
            series_uid: series_uid.to_string(),
            suffix: String::new(),
            reference_paths: Vec::new(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    pub fn id(&self) -> &str {
        &self.series_id
    }

    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }

    pub fn uid(&self) -> &str {
        &self.series_uid
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn reference_paths(&self) -> &[PathBuf] {
        &self.reference_paths
    }

    pub fn path(&self) -> IdPath {
        IdPath::series(&self.subject_id, &self.study_id, &self.series_id)
    }

    pub fn parent(&self) -> Study {
        Study::bound(&self.subject_id, &self.study_id, &self.study_uid)
    }

    pub fn state<S: FileStore>(&self, db: &Database<S>) -> SeriesState {
        if self.series_id.is_empty() {
            SeriesState::Deleted
        } else if db.index().image_paths(&self.path()).is_empty() {
            SeriesState::Unbound
        } else {
            SeriesState::Bound
        }
    }

    pub(crate) fn live(&self) -> Result<IdPath> {
        if self.series_id.is_empty() {
            return Err(IndexError::Deleted);
        }
        Ok(self.path())
    }

    pub fn image_paths<S: FileStore>(&self, db: &Database<S>) -> Vec<PathBuf> {
        db.index().image_paths(&self.path())
    }

    pub fn images<S: FileStore>(&self, db: &Database<S>) -> Vec<Image> {
        self.image_paths(db)
            .iter()
            .filter_map(|path| Image::resolve(db, path))
            .collect()
    }

    /// Images ordered by `sort_by`. Images without the sort key keep their
    /// index order and go last.
    ///
    /// # Errors
    ///
    /// The first tag read failure.
    pub fn sorted_images<S: FileStore>(&self, db: &Database<S>, sort_by: SortBy) -> Result<Vec<Image>> {
        let mut keyed = Vec::new();
        for path in self.image_paths(db) {
            let key = match sort_by {
                SortBy::None => None,
                _ => Self::sort_key(&db.store().read_tags(&path)?, sort_by),
            };
            keyed.push((key, path));
        }
        keyed.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Ok(keyed
            .into_iter()
            .filter_map(|(_, path)| Image::resolve(db, &path))
            .collect())
    }

    fn sort_key(tags: &TagSet, sort_by: SortBy) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => tags.floats(Tag::ImagePositionPatient)?.get(2).copied(),
            SortBy::TablePosition => tags.float(Tag::TablePosition).or_else(|| tags.float(Tag::SliceLocation)),
            SortBy::InstanceNumber => tags.int(Tag::InstanceNumber).map(|n| n as f64),
            SortBy::None => None,
        }
    }

    pub(crate) fn identity(&self) -> TagSet {
        let (number, description) = series_parts(&self.series_id);
        series_tags(&number, &description, &self.series_uid)
    }

    pub(crate) fn target(&self) -> Target {
        Target {
            subject: Some(self.subject_id.clone()),
            study: Some(study_tags(&self.study_id, &self.study_uid)),
            series: Some(self.identity()),
        }
    }

    fn derived_id<S: FileStore>(&self, db: &Database<S>, study: &IdPath, suffix: &str) -> Result<String> {
        let identity = self.identity();
        let description = format!("{}{suffix}", IdGenerator::series_description(&identity));
        let candidate = identity.with(Tag::SeriesDescription, description);
        IdGenerator::new_series_name(db.index(), study, &candidate, suffix)
    }

    /// An unbound sibling series with a suffixed description and a new UID.
    /// The current images become its reference paths.
    pub fn new_sibling<S: FileStore>(&self, db: &Database<S>, suffix: &str) -> Result<Series> {
        let path = self.live()?;
        let reference_paths = match db.index().image_paths(&path) {
            images if images.is_empty() => self.reference_paths.clone(),
            images => images,
        };
        let study = self.parent().path();
        Ok(Series {
            series_id: self.derived_id(db, &study, suffix)?,
            series_uid: IdGenerator::generate_uid(&self.series_uid),
            suffix: suffix.to_string(),
            reference_paths,
            ..self.clone()
        })
    }

    /// Bind this series by writing `arrays` as its pixel data.
    ///
    /// An unbound series clones one reference file per array and writes
    /// the array into the clone; a bound series overwrites its own images
    /// in index order. Extra arrays or images are ignored.
    pub fn write<S: FileStore>(
        &mut self,
        db: &mut Database<S>,
        arrays: &[Array2<f32>],
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchReport> {
        let path = self.live()?;
        let existing = db.index().image_paths(&path);
        let bound = !existing.is_empty();
        let templates = if bound { existing } else { self.reference_paths.clone() };
        if templates.is_empty() {
            return Err(IndexError::Unbound);
        }

        let overrides = self.target().overrides();
        let total = templates.len().min(arrays.len());
        let mut report = BatchReport::default();
        for (i, (template, pixels)) in templates.into_iter().zip(arrays).enumerate() {
            if progress.is_cancelled() {
                report.cancelled = true;
                break;
            }
            progress.progress(total, i, "Writing series");
            let written = if bound {
                db.store().write_pixel_array(&template, pixels).map(|()| template.clone())
            } else {
                Self::write_clone(db, &template, &overrides, &self.suffix, pixels)
            };
            match written {
                Ok(path) => report.succeeded.push(path),
                Err(error) => {
                    warn!(path = %template.display(), %error, "writing series image failed");
                    report.failed.push((template, error));
                }
            }
        }
        progress.update(total);
        progress.close();
        Ok(report)
    }

    /// Clone `template` into the series described by `overrides` and write
    /// `pixels` into the clone. A clone whose pixels cannot be written is
    /// deleted again.
    pub(crate) fn write_clone<S: FileStore>(
        db: &mut Database<S>,
        template: &Path,
        overrides: &TagSet,
        suffix: &str,
        pixels: &Array2<f32>,
    ) -> Result<PathBuf> {
        let job = Job {
            source: template.to_path_buf(),
            overrides: overrides.clone(),
        };
        let mut report = db.transfer(vec![job], Transfer::Copy, suffix, &mut NoProgress);
        let Some(path) = report.succeeded.pop() else {
            return Err(report
                .failed
                .pop()
                .map(|(_, error)| error)
                .unwrap_or(IndexError::Unbound));
        };
        if let Err(error) = db.store().write_pixel_array(&path, pixels) {
            db.delete_files(vec![path], &mut NoProgress);
            return Err(error);
        }
        Ok(path)
    }

    /// Copy every image into a new series under `new_parent`, or next to
    /// this one when `None`.
    pub fn copy<S: FileStore>(
        &self,
        db: &mut Database<S>,
        suffix: &str,
        new_parent: Option<&Study>,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        let source = self.live()?;
        db.bound_images(&source)?;
        let parent = match new_parent {
            Some(parent) => {
                parent.live()?;
                parent.clone()
            }
            None => self.parent(),
        };
        let copy = Series {
            subject_id: parent.subject_id().to_string(),
            study_id: parent.id().to_string(),
            series_id: self.derived_id(db, &parent.path(), suffix)?,
            study_uid: parent.uid().to_string(),
            series_uid: IdGenerator::generate_uid(&self.series_uid),
            suffix: suffix.to_string(),
            reference_paths: Vec::new(),
        };
        let report = db.relocate(&[source], &copy.target(), Transfer::Copy, suffix, progress)?;
        Ok((copy, report))
    }

    pub fn delete<S: FileStore>(&mut self, db: &mut Database<S>, progress: &mut dyn ProgressSink) -> Result<BatchReport> {
        let path = self.live()?;
        let images = db.index().image_paths(&path);
        let report = db.delete_files(images, progress);
        if !db.index().contains(&path) {
            *self = Series::bound("", "", "", "", "");
        }
        Ok(report)
    }

    /// Copy all `series` into one new series called `name` in the study of
    /// the first one. A leading number in `name` (`99_Merged`) becomes the
    /// SeriesNumber; otherwise the first series' number is kept.
    pub fn merge<S: FileStore>(
        db: &mut Database<S>,
        series: &[Series],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        Self::merge_with(db, series, name, Transfer::Copy, progress)
    }

    /// Like [`Series::merge`] but re-tags the images in place and removes
    /// the emptied sources. Irreversible.
    pub fn merge_move<S: FileStore>(
        db: &mut Database<S>,
        series: &[Series],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        Self::merge_with(db, series, name, Transfer::Move, progress)
    }

    fn merge_with<S: FileStore>(
        db: &mut Database<S>,
        series: &[Series],
        name: &str,
        mode: Transfer,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Series, BatchReport)> {
        let sources = series.iter().map(Series::live).collect::<Result<Vec<_>>>()?;
        let Some(first) = series.first() else {
            return Err(IndexError::NotFound("no series to merge".to_string()));
        };
        let merged = Self::merge_target(db, first, name)?;
        let suffix = db.config().collision_suffix.clone();
        let type_id = match mode {
            Transfer::Copy => suffix.as_str(),
            Transfer::Move => "",
        };
        let report = db.relocate(&sources, &merged.target(), mode, type_id, progress)?;
        Ok((merged, report))
    }

    /// The series a merge named `name` lands in, next to `first`.
    pub(crate) fn merge_target<S: FileStore>(db: &Database<S>, first: &Series, name: &str) -> Result<Series> {
        let (number, description) = IdGenerator::split_series_name(name);
        let number = match number {
            Some(number) => number.to_string(),
            None => series_parts(&first.series_id).0,
        };
        let candidate = series_tags(&number, description, "");
        let series_id =
            IdGenerator::new_series_name(db.index(), &first.parent().path(), &candidate, &db.config().collision_suffix)?;
        Ok(Series {
            series_id,
            series_uid: IdGenerator::generate_uid(&first.series_uid),
            suffix: String::new(),
            reference_paths: Vec::new(),
            ..first.clone()
        })
    }

    pub fn get_value<S: FileStore>(&self, db: &Database<S>, tag: Tag) -> Result<TagValues> {
        let images = db.bound_images(&self.live()?)?;
        Ok(db.read_tag_files(images, tag))
    }

    /// Write `tag` into every image. ID-defining tags re-key the images and
    /// the handle follows them to their new series.
    pub fn set_value<S: FileStore>(
        &mut self,
        db: &mut Database<S>,
        tag: Tag,
        value: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchReport> {
        let images = db.bound_images(&self.live()?)?;
        let report = db.write_tag_files(images, tag, value, progress);
        if let Some(moved) = report.succeeded.first().and_then(|path| Image::resolve(db, path)) {
            let parent = moved.parent();
            self.subject_id = parent.subject_id().to_string();
            self.study_id = parent.study_id().to_string();
            self.series_id = parent.id().to_string();
            self.study_uid = parent.study_uid().to_string();
            self.series_uid = parent.uid().to_string();
        }
        Ok(report)
    }

    /// Map `mask`, drawn on `source`, onto every image of this series.
    ///
    /// # Errors
    ///
    /// Fails as a whole only when the source geometry cannot be built;
    /// target images without geometry get their own `GeometryMissing`.
    /// Images after a cancellation are left out.
    pub fn map_mask_onto<S: FileStore>(
        &self,
        db: &Database<S>,
        mask: ArrayView2<'_, bool>,
        source: &Image,
        progress: &mut dyn ProgressSink,
    ) -> Result<MappedMasks> {
        let source = source.geometry(db)?;
        let points = AffineMapper::mask_points(mask);
        let targets = db.bound_images(&self.live()?)?;
        let total = targets.len();
        let mut mapped = Vec::with_capacity(total);
        for (i, path) in targets.into_iter().enumerate() {
            if progress.is_cancelled() {
                break;
            }
            progress.progress(total, i, "Mapping mask");
            let result = db
                .store()
                .read_tags(&path)
                .and_then(|tags| Geometry::from_dataset(&tags))
                .and_then(|target| AffineMapper::map_points(&points, source.affine_matrix(), target.affine_matrix()));
            mapped.push((path, result));
        }
        progress.update(total);
        progress.close();
        Ok(mapped)
    }
}
