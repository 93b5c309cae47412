use crate::batch::{BatchReport, ProgressSink, TagValues};
use crate::database::{Database, Target, Transfer};
use crate::error::{IndexError, Result};
use crate::id_generator::IdGenerator;
use crate::image::Image;
use crate::metadata_index::IdPath;
use crate::store::FileStore;
use crate::study::Study;
use crate::tag::Tag;

/// Handle on a subject (patient). Holds only its ID; every operation
/// resolves it against the database again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    subject_id: String,
    suffix: String,
}

impl Subject {
    pub(crate) fn bound(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            suffix: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.subject_id
    }

    /// Suffix this handle was derived with, empty for scanned subjects.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn path(&self) -> IdPath {
        IdPath::subject(&self.subject_id)
    }

    pub fn is_deleted(&self) -> bool {
        self.subject_id.is_empty()
    }

    pub fn is_bound<S: FileStore>(&self, db: &Database<S>) -> bool {
        !self.is_deleted() && !db.index().image_paths(&self.path()).is_empty()
    }

    pub(crate) fn live(&self) -> Result<IdPath> {
        if self.is_deleted() {
            return Err(IndexError::Deleted);
        }
        Ok(self.path())
    }

    pub fn studies<S: FileStore>(&self, db: &Database<S>) -> Vec<Study> {
        db.index()
            .children(&self.path())
            .iter()
            .map(|node| Study::bound(&self.subject_id, node.id(), node.uid()))
            .collect()
    }

    pub fn images<S: FileStore>(&self, db: &Database<S>) -> Vec<Image> {
        db.index()
            .image_paths(&self.path())
            .iter()
            .filter_map(|path| Image::resolve(db, path))
            .collect()
    }

    /// An unbound sibling named `<id><suffix>`, with the suffix appended
    /// again for as long as that name holds images.
    pub fn new_sibling<S: FileStore>(&self, db: &Database<S>, suffix: &str) -> Result<Subject> {
        self.live()?;
        let candidate = format!("{}{suffix}", self.subject_id);
        let subject_id = IdGenerator::new_subject_name(db.index(), &candidate, suffix)?;
        Ok(Subject {
            subject_id,
            suffix: suffix.to_string(),
        })
    }

    /// Copy every image of this subject into a new sibling subject. Study
    /// and series names are kept; all UIDs are new.
    pub fn copy<S: FileStore>(
        &self,
        db: &mut Database<S>,
        suffix: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Subject, BatchReport)> {
        let source = self.live()?;
        db.bound_images(&source)?;
        let copy = self.new_sibling(db, suffix)?;
        let report = db.relocate(&[source], &copy.target(), Transfer::Copy, suffix, progress)?;
        Ok((copy, report))
    }

    /// Delete every file of the subject. The handle is cleared once the
    /// subject has left the index.
    pub fn delete<S: FileStore>(&mut self, db: &mut Database<S>, progress: &mut dyn ProgressSink) -> Result<BatchReport> {
        let path = self.live()?;
        let images = db.index().image_paths(&path);
        let report = db.delete_files(images, progress);
        if !db.index().contains(&path) {
            self.subject_id.clear();
            self.suffix.clear();
        }
        Ok(report)
    }

    /// Copy the images of all `subjects` into one new subject called `name`.
    /// Studies and series that would collide get the collision suffix.
    pub fn merge<S: FileStore>(
        db: &mut Database<S>,
        subjects: &[Subject],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Subject, BatchReport)> {
        Self::merge_with(db, subjects, name, Transfer::Copy, progress)
    }

    /// Re-tag the images of all `subjects` in place so they belong to one
    /// subject called `name`. The emptied originals disappear. Irreversible.
    pub fn merge_move<S: FileStore>(
        db: &mut Database<S>,
        subjects: &[Subject],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Subject, BatchReport)> {
        Self::merge_with(db, subjects, name, Transfer::Move, progress)
    }

    fn merge_with<S: FileStore>(
        db: &mut Database<S>,
        subjects: &[Subject],
        name: &str,
        mode: Transfer,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Subject, BatchReport)> {
        let sources = subjects.iter().map(Subject::live).collect::<Result<Vec<_>>>()?;
        if sources.is_empty() {
            return Err(IndexError::NotFound("no subjects to merge".to_string()));
        }
        let suffix = db.config().collision_suffix.clone();
        let merged = Subject {
            subject_id: IdGenerator::new_subject_name(db.index(), name, &suffix)?,
            suffix: String::new(),
        };
        let type_id = match mode {
            Transfer::Copy => suffix.as_str(),
            Transfer::Move => "",
        };
        let report = db.relocate(&sources, &merged.target(), mode, type_id, progress)?;
        Ok((merged, report))
    }

    pub fn get_value<S: FileStore>(&self, db: &Database<S>, tag: Tag) -> Result<TagValues> {
        let images = db.bound_images(&self.live()?)?;
        Ok(db.read_tag_files(images, tag))
    }

    /// Write `tag` into every image. Setting PatientID moves the images and
    /// this handle to the new subject.
    pub fn set_value<S: FileStore>(
        &mut self,
        db: &mut Database<S>,
        tag: Tag,
        value: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchReport> {
        let images = db.bound_images(&self.live()?)?;
        let report = db.write_tag_files(images, tag, value, progress);
        if let Some(series) = report.succeeded.first().and_then(|path| db.index().series_of(path)) {
            self.subject_id = series.subject_id().to_string();
        }
        Ok(report)
    }

    fn target(&self) -> Target {
        Target {
            subject: Some(self.subject_id.clone()),
            ..Target::default()
        }
    }
}
