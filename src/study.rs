use crate::batch::{BatchReport, ProgressSink, TagValues};
use crate::database::{Database, Target, Transfer, study_tags};
use crate::error::{IndexError, Result};
use crate::id_generator::IdGenerator;
use crate::image::Image;
use crate::metadata_index::IdPath;
use crate::series::Series;
use crate::store::FileStore;
use crate::subject::Subject;
use crate::tag::{Tag, TagSet};

/// Handle on a study, keyed by `<StudyDate>_<StudyTime>_<StudyDescription>`
/// under its subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Study {
    subject_id: String,
    study_id: String,
    study_uid: String,
    suffix: String,
}

impl Study {
    pub(crate) fn bound(subject_id: &str, study_id: &str, study_uid: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            study_id: study_id.to_string(),
            study_uid: study_uid.to_string(),
            suffix: String::new(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn id(&self) -> &str {
        &self.study_id
    }

    pub fn uid(&self) -> &str {
        &self.study_uid
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn path(&self) -> IdPath {
        IdPath::study(&self.subject_id, &self.study_id)
    }

    pub fn parent(&self) -> Subject {
        Subject::bound(&self.subject_id)
    }

    pub fn is_deleted(&self) -> bool {
        self.study_id.is_empty()
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

    pub fn series<S: FileStore>(&self, db: &Database<S>) -> Vec<Series> {
        db.index()
            .children(&self.path())
            .iter()
            .map(|node| Series::bound(&self.subject_id, &self.study_id, node.id(), &self.study_uid, node.uid()))
            .collect()
    }

    pub fn images<S: FileStore>(&self, db: &Database<S>) -> Vec<Image> {
        db.index()
            .image_paths(&self.path())
            .iter()
            .filter_map(|path| Image::resolve(db, path))
            .collect()
    }

    /// Tags that place an image in this study.
    pub(crate) fn identity(&self) -> TagSet {
        study_tags(&self.study_id, &self.study_uid)
    }

    pub(crate) fn target(&self) -> Target {
        Target {
            subject: Some(self.subject_id.clone()),
            study: Some(self.identity()),
            series: None,
        }
    }

    /// `<date>_<time>_<description><suffix>` under `subject_id`, made free
    /// of collisions by appending `suffix` again.
    fn derived_id<S: FileStore>(&self, db: &Database<S>, subject_id: &str, suffix: &str) -> Result<String> {
        let identity = self.identity();
        let description = format!("{}{suffix}", IdGenerator::study_description(&identity));
        let candidate = identity.with(Tag::StudyDescription, description);
        let description =
            IdGenerator::new_study_description(db.index(), &IdPath::subject(subject_id), &candidate, suffix, &[])?;
        Ok(IdGenerator::compose(&IdGenerator::study_ordinal(&candidate), &description))
    }

    /// An unbound sibling study with a suffixed description and a new UID.
    pub fn new_sibling<S: FileStore>(&self, db: &Database<S>, suffix: &str) -> Result<Study> {
        self.live()?;
        Ok(Study {
            subject_id: self.subject_id.clone(),
            study_id: self.derived_id(db, &self.subject_id, suffix)?,
            study_uid: IdGenerator::generate_uid(&self.study_uid),
            suffix: suffix.to_string(),
        })
    }

    /// Copy every image of the study into a new study under `new_parent`,
    /// or next to this one when `None`.
    pub fn copy<S: FileStore>(
        &self,
        db: &mut Database<S>,
        suffix: &str,
        new_parent: Option<&Subject>,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Study, BatchReport)> {
        let source = self.live()?;
        db.bound_images(&source)?;
        let subject_id = match new_parent {
            Some(parent) => parent.live()?.subject_id().to_string(),
            None => self.subject_id.clone(),
        };
        let copy = Study {
            study_id: self.derived_id(db, &subject_id, suffix)?,
            subject_id,
            study_uid: IdGenerator::generate_uid(&self.study_uid),
            suffix: suffix.to_string(),
        };
        let report = db.relocate(&[source], &copy.target(), Transfer::Copy, suffix, progress)?;
        Ok((copy, report))
    }

    pub fn delete<S: FileStore>(&mut self, db: &mut Database<S>, progress: &mut dyn ProgressSink) -> Result<BatchReport> {
        let path = self.live()?;
        let images = db.index().image_paths(&path);
        let report = db.delete_files(images, progress);
        if !db.index().contains(&path) {
            self.study_id.clear();
            self.study_uid.clear();
            self.subject_id.clear();
            self.suffix.clear();
        }
        Ok(report)
    }

    /// Copy all `studies` into one new study described as `name`, under the
    /// subject of the first one. Colliding series get the collision suffix.
    pub fn merge<S: FileStore>(
        db: &mut Database<S>,
        studies: &[Study],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Study, BatchReport)> {
        Self::merge_with(db, studies, name, Transfer::Copy, progress)
    }

    /// Like [`Study::merge`] but re-tags the images in place; the source
    /// studies are emptied and removed. Irreversible.
    pub fn merge_move<S: FileStore>(
        db: &mut Database<S>,
        studies: &[Study],
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Study, BatchReport)> {
        Self::merge_with(db, studies, name, Transfer::Move, progress)
    }

    fn merge_with<S: FileStore>(
        db: &mut Database<S>,
        studies: &[Study],
        name: &str,
        mode: Transfer,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Study, BatchReport)> {
        let sources = studies.iter().map(Study::live).collect::<Result<Vec<_>>>()?;
        let Some(first) = studies.first() else {
            return Err(IndexError::NotFound("no studies to merge".to_string()));
        };
        let suffix = db.config().collision_suffix.clone();
        let candidate = first.identity().with(Tag::StudyDescription, name);
        let description = IdGenerator::new_study_description(
            db.index(),
            &IdPath::subject(&first.subject_id),
            &candidate,
            &suffix,
            &[],
        )?;
        let merged = Study {
            subject_id: first.subject_id.clone(),
            study_id: IdGenerator::compose(&IdGenerator::study_ordinal(&candidate), &description),
            study_uid: IdGenerator::generate_uid(&first.study_uid),
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

    /// Write `tag` into every image of the study. When the tag is part of
    /// the subject or study ID the images are re-keyed and the handle
    /// follows them.
    pub fn set_value<S: FileStore>(
        &mut self,
        db: &mut Database<S>,
        tag: Tag,
        value: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchReport> {
        let images = db.bound_images(&self.live()?)?;
        let report = db.write_tag_files(images, tag, value, progress);
        if let Some(study) = report
            .succeeded
            .first()
            .and_then(|path| db.index().series_of(path))
            .and_then(|series| series.parent())
        {
            self.subject_id = study.subject_id().to_string();
            self.study_id = study.id().to_string();
            if let Some(node) = db.index().node_at(&study) {
                self.study_uid = node.uid().to_string();
            }
        }
        Ok(report)
    }
}
