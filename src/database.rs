//! The single-writer owner of an index and the files behind it.
//!
//! Every ObjectGraph handle ([`Subject`], [`Study`], [`Series`], [`Image`])
//! is a plain set of IDs; its operations borrow the `Database` and
//! re-resolve those IDs against the index each time. Batch operations run
//! one file at a time, poll the progress sink for cancellation between
//! files, and keep going after individual failures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::batch::{BatchReport, ProgressSink};
use crate::config::IndexConfig;
use crate::enums::Level;
use crate::error::{IndexError, Result};
use crate::id_generator::IdGenerator;
use crate::image::Image;
use crate::index_loader::IndexLoader;
use crate::metadata_index::{IdPath, ImageRecord, MetadataIndex};
use crate::store::FileStore;
use crate::subject::Subject;
use crate::tag::{Dataset, Tag, TagSet};

pub struct Database<S: FileStore> {
    index: MetadataIndex,
    store: S,
    config: IndexConfig,
}

impl<S: FileStore + Sync> Database<S> {
    /// Open the index for `folder`, rebuilding it from the files when the
    /// persisted document is missing or unreadable.
    pub fn open(folder: impl AsRef<Path>, store: S, config: IndexConfig) -> Result<Self> {
        let index = IndexLoader::open(folder.as_ref(), &store, &config)?;
        Ok(Self::new(index, store, config))
    }

    /// Discard the in-memory index and scan the folder again.
    pub fn rebuild(&mut self, folder: impl AsRef<Path>) -> Result<()> {
        let location = self.index.location().to_path_buf();
        let mut index = IndexLoader::scan(folder.as_ref(), &self.store, &self.config)?;
        index.set_location(location);
        index.set_collision_suffix(self.config.collision_suffix.as_str());
        self.index = index;
        Ok(())
    }
}

impl<S: FileStore> Database<S> {
    pub fn new(mut index: MetadataIndex, store: S, config: IndexConfig) -> Self {
        index.set_collision_suffix(config.collision_suffix.as_str());
        Self {
            index,
            store,
            config,
        }
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Direct index access, for UI state such as `checked` flags.
    pub fn index_mut(&mut self) -> &mut MetadataIndex {
        &mut self.index
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn into_parts(self) -> (MetadataIndex, S) {
        (self.index, self.store)
    }

    pub fn save(&self) -> Result<()> {
        self.index.save()
    }

    pub fn subjects(&self) -> Vec<Subject> {
        self.index
            .subjects()
            .iter()
            .filter_map(|&id| self.index.node(id))
            .map(|node| Subject::bound(node.id()))
            .collect()
    }

    pub fn subject(&self, subject_id: &str) -> Option<Subject> {
        self.index
            .contains(&IdPath::subject(subject_id))
            .then(|| Subject::bound(subject_id))
    }

    pub fn image(&self, path: &Path) -> Option<Image> {
        Image::resolve(self, path)
    }

    /// Check that the tags in the file at `path` still produce the IDs and
    /// UIDs recorded on its ancestors.
    ///
    /// # Errors
    ///
    /// `NotFound` when the path is not indexed, `ConsistencyViolation` on
    /// drift, or the store's error when the file cannot be read.
    pub fn verify_image(&self, path: &Path) -> Result<()> {
        let series_path = self
            .index
            .series_of(path)
            .ok_or_else(|| IndexError::NotFound(path.display().to_string()))?;
        let tags = self.store.read_tags(path)?;

        let violation = |tag: Tag, indexed: &str| IndexError::ConsistencyViolation {
            path: path.to_path_buf(),
            tag,
            indexed: indexed.to_string(),
            on_disk: tags.text(tag).map(str::to_string),
        };

        let uid_matches = |level_path: Option<IdPath>, tag: Tag| {
            level_path
                .and_then(|p| self.index.node_at(&p))
                .is_some_and(|node| !node.uid().is_empty() && tags.text(tag) == Some(node.uid()))
        };

        if IdGenerator::subject_id(&tags) != series_path.subject_id() {
            return Err(violation(Tag::PatientID, series_path.subject_id()));
        }

        let mut study_parts = series_path.study_id().unwrap_or_default().splitn(3, '_');
        let date = study_parts.next().unwrap_or_default();
        let time = study_parts.next().unwrap_or_default();
        let description = study_parts.next().unwrap_or_default();
        let ordinal = IdGenerator::study_ordinal(&tags);
        let (disk_date, disk_time) = ordinal.split_once('_').unwrap_or_default();
        if disk_date != date {
            return Err(violation(Tag::StudyDate, date));
        }
        if disk_time != time {
            return Err(violation(Tag::StudyTime, time));
        }
        let study_uid_matches = uid_matches(series_path.parent(), Tag::StudyInstanceUID);
        if !same_description(description, &IdGenerator::study_description(&tags), study_uid_matches) {
            return Err(violation(Tag::StudyDescription, description));
        }

        let (number, description) = series_parts(series_path.series_id().unwrap_or_default());
        if IdGenerator::series_ordinal(&tags) != number {
            return Err(violation(Tag::SeriesNumber, &number));
        }
        let series_uid_matches = uid_matches(Some(series_path.clone()), Tag::SeriesInstanceUID);
        if !same_description(&description, &IdGenerator::series_description(&tags), series_uid_matches) {
            return Err(violation(Tag::SeriesDescription, &description));
        }

        for (level_path, tag) in [
            (series_path.parent(), Tag::StudyInstanceUID),
            (Some(series_path.clone()), Tag::SeriesInstanceUID),
        ] {
            let Some(node) = level_path
                .and_then(|p| self.index.find(&p))
                .and_then(|id| self.index.node(id))
            else {
                continue;
            };
            if !node.uid().is_empty() && tags.text(tag) != Some(node.uid()) {
                return Err(violation(tag, node.uid()));
            }
        }
        Ok(())
    }

    /// Verify every indexed image and return all violations found.
    pub fn verify(&self) -> Vec<IndexError> {
        self.index
            .all_image_paths()
            .iter()
            .filter_map(|path| self.verify_image(path).err())
            .collect()
    }

    pub(crate) fn type_id_of(&self, series: &IdPath) -> String {
        self.index
            .find(series)
            .and_then(|id| self.index.node(id))
            .map(|node| node.type_id().to_string())
            .unwrap_or_default()
    }

    /// Copy or move each job's file, file the result into the index and
    /// collect per-file outcomes.
    pub(crate) fn transfer(
        &mut self,
        jobs: Vec<Job>,
        mode: Transfer,
        type_id: &str,
        progress: &mut dyn ProgressSink,
    ) -> BatchReport {
        let message = match mode {
            Transfer::Copy => "Copying images",
            Transfer::Move => "Moving images",
        };
        let total = jobs.len();
        let mut report = BatchReport::default();

        for (i, job) in jobs.into_iter().enumerate() {
            if progress.is_cancelled() {
                info!(done = i, total, "{message}: cancelled");
                report.cancelled = true;
                break;
            }
            progress.progress(total, i, message);
            let result = match mode {
                Transfer::Copy => self.copy_one(&job, type_id),
                Transfer::Move => self.move_one(&job, type_id),
            };
            match result {
                Ok(path) => report.succeeded.push(path),
                Err(error) => {
                    warn!(path = %job.source.display(), %error, "{message}: skipped");
                    report.failed.push((job.source, error));
                }
            }
        }
        progress.update(total);
        progress.close();
        report
    }

    /// Plan every image below `sources` onto `target` and run the transfer.
    /// Copies get fresh UIDs; moves keep them.
    pub(crate) fn relocate(
        &mut self,
        sources: &[IdPath],
        target: &Target,
        mode: Transfer,
        type_id: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<BatchReport> {
        let jobs = {
            let mut planner = Planner::new(&self.index, &self.config.collision_suffix, mode == Transfer::Copy);
            for source in sources {
                planner.add(source, target)?;
            }
            planner.into_jobs()
        };
        Ok(self.transfer(jobs, mode, type_id, progress))
    }

    fn copy_one(&mut self, job: &Job, type_id: &str) -> Result<PathBuf> {
        let mut tags = self.store.read_tags(&job.source)?;
        let mut overrides = job.overrides.clone();
        let related = tags
            .text(Tag::SOPInstanceUID)
            .or_else(|| overrides.text(Tag::SeriesInstanceUID))
            .unwrap_or_default()
            .to_string();
        overrides.insert(Tag::SOPInstanceUID, IdGenerator::generate_uid(&related));

        let target = self.copy_path(&job.source, type_id);
        self.store.copy(&job.source, &target, &overrides)?;

        tags.apply(&overrides);
        self.index
            .file_planned(ImageRecord::from_tags(&target, &tags, type_id));
        Ok(target)
    }

    fn move_one(&mut self, job: &Job, type_id: &str) -> Result<PathBuf> {
        let mut tags = self.store.read_tags(&job.source)?;
        self.store.write_tags(&job.source, &job.overrides)?;
        tags.apply(&job.overrides);

        let record = ImageRecord::from_tags(&job.source, &tags, type_id);
        if self.index.move_image(record.clone()).is_none() {
            self.index.file_planned(record);
        }
        Ok(job.source.clone())
    }

    /// Sibling path for a copy of `source` that is free both on disk and in
    /// the index.
    fn copy_path(&self, source: &Path, suffix: &str) -> PathBuf {
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let suffix = if suffix.is_empty() { "_copy" } else { suffix };

        let taken = |path: &Path| self.store.exists(path) || self.index.contains_image(path);
        let first = dir.join(format!("{stem}{suffix}{extension}"));
        if !taken(&first) {
            return first;
        }
        (2..)
            .map(|n| dir.join(format!("{stem}{suffix}_{n}{extension}")))
            .find(|path| !taken(path))
            .unwrap_or(first)
    }

    /// Delete each file, then drop it from the index. A file that cannot be
    /// deleted keeps its index entry.
    pub(crate) fn delete_files(&mut self, paths: Vec<PathBuf>, progress: &mut dyn ProgressSink) -> BatchReport {
        let total = paths.len();
        let mut report = BatchReport::default();
        for (i, path) in paths.into_iter().enumerate() {
            if progress.is_cancelled() {
                report.cancelled = true;
                break;
            }
            progress.progress(total, i, "Deleting images");
            match self.store.delete(&path) {
                Ok(()) => {
                    self.index.remove(&path);
                    report.succeeded.push(path);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "delete failed");
                    report.failed.push((path, error));
                }
            }
        }
        progress.update(total);
        progress.close();
        report
    }

    /// Write `tag` into each file. When the tag takes part in an ID the
    /// image is re-keyed in the index right after its file is written; the
    /// new record is computed before the write, so a failed write leaves
    /// both file and index untouched.
    pub(crate) fn write_tag_files(
        &mut self,
        paths: Vec<PathBuf>,
        tag: Tag,
        value: &str,
        progress: &mut dyn ProgressSink,
    ) -> BatchReport {
        let total = paths.len();
        let mut report = BatchReport::default();
        for (i, path) in paths.into_iter().enumerate() {
            if progress.is_cancelled() {
                report.cancelled = true;
                break;
            }
            progress.progress(total, i, "Writing tag");
            match self.write_tag_one(&path, tag, value) {
                Ok(()) => report.succeeded.push(path),
                Err(error) => {
                    warn!(path = %path.display(), tag = tag.keyword(), %error, "tag write failed");
                    report.failed.push((path, error));
                }
            }
        }
        progress.update(total);
        progress.close();
        report
    }

    fn write_tag_one(&mut self, path: &Path, tag: Tag, value: &str) -> Result<()> {
        if !tag.is_id_defining() {
            return self.store.write_tag(path, tag, value);
        }
        let mut tags = self.store.read_tags(path)?;
        tags.insert(tag, value);
        let mut record = ImageRecord::from_tags(path, &tags, "");
        let mut writes = TagSet::new().with(tag, value);

        let sets_uid = matches!(tag, Tag::StudyInstanceUID | Tag::SeriesInstanceUID);
        if let (false, Some(old_series)) = (sets_uid, self.index.series_of(path)) {
            let target_study = IdPath::study(&record.subject_id, &record.study_id);
            let study_uid = self.placement_uid(old_series.parent(), &target_study, &record.study_uid);
            let series_uid = self.placement_uid(Some(old_series), &record.series_path(), &record.series_uid);
            if study_uid != record.study_uid {
                writes.insert(Tag::StudyInstanceUID, study_uid.as_str());
                record.study_uid = study_uid;
            }
            if series_uid != record.series_uid {
                writes.insert(Tag::SeriesInstanceUID, series_uid.as_str());
                record.series_uid = series_uid;
            }
        }

        self.store.write_tags(path, &writes)?;
        let series = record.series_path();
        if self.index.move_image(record).is_none() {
            warn!(path = %path.display(), "tag written to an image missing from the index");
            return Ok(());
        }
        let uid_owner = match tag {
            Tag::StudyInstanceUID => series.parent(),
            Tag::SeriesInstanceUID => Some(series),
            _ => None,
        };
        if let (Some(owner), Some(uid)) = (uid_owner, tags.text(tag)) {
            self.index.set_uid(&owner, uid);
        }
        Ok(())
    }

    /// UID for an image leaving `old` for `target`. An existing target node
    /// lends its UID. A new node keeps `current` only when the image is the
    /// last one in `old`; otherwise it gets a UID derived from `current`.
    fn placement_uid(&self, old: Option<IdPath>, target: &IdPath, current: &str) -> String {
        match self.index.node_at(target) {
            Some(node) if !node.uid().is_empty() => node.uid().to_string(),
            Some(_) => current.to_string(),
            None if old.is_some_and(|old| self.index.image_paths(&old).len() == 1) => current.to_string(),
            None => IdGenerator::generate_uid(current),
        }
    }

    /// Image files below `path`, or `Unbound` when there are none.
    pub(crate) fn bound_images(&self, path: &IdPath) -> Result<Vec<PathBuf>> {
        let images = self.index.image_paths(path);
        if images.is_empty() {
            return Err(IndexError::Unbound);
        }
        Ok(images)
    }

    /// Read `tag` from every file, keeping per-file errors.
    pub(crate) fn read_tag_files(&self, paths: Vec<PathBuf>, tag: Tag) -> Vec<(PathBuf, Result<Option<String>>)> {
        paths
            .into_iter()
            .map(|path| {
                let value = self.store.read_tag(&path, tag);
                (path, value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transfer {
    Copy,
    Move,
}

#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) source: PathBuf,
    pub(crate) overrides: TagSet,
}

/// Fixed placement for the upper levels of a transfer. Levels left `None`
/// keep the source's IDs, renamed only when they collide.
#[derive(Debug, Clone, Default)]
pub(crate) struct Target {
    pub(crate) subject: Option<String>,
    pub(crate) study: Option<TagSet>,
    pub(crate) series: Option<TagSet>,
}

/// Plans the tag overrides for every image below one or more source nodes.
pub(crate) struct Planner<'a> {
    index: &'a MetadataIndex,
    suffix: &'a str,
    fresh_uids: bool,
    reserved: HashMap<IdPath, Vec<String>>,
    studies: HashMap<(IdPath, String), (IdPath, TagSet)>,
    series: HashMap<(IdPath, IdPath), TagSet>,
    jobs: Vec<Job>,
}

impl<'a> Planner<'a> {
    pub(crate) fn new(index: &'a MetadataIndex, suffix: &'a str, fresh_uids: bool) -> Self {
        Self {
            index,
            suffix,
            fresh_uids,
            reserved: HashMap::new(),
            studies: HashMap::new(),
            series: HashMap::new(),
            jobs: Vec::new(),
        }
    }

    /// Queue every image below `source`.
    pub(crate) fn add(&mut self, source: &IdPath, target: &Target) -> Result<()> {
        let series_paths = self.series_below(source);
        for series_path in series_paths {
            let Some(study_path) = series_path.parent() else { continue };
            let subject_id = target
                .subject
                .clone()
                .unwrap_or_else(|| series_path.subject_id().to_string());

            let (target_study, study_tags) = match &target.study {
                Some(tags) => (
                    IdPath::study(&subject_id, IdGenerator::study_id(tags)),
                    tags.clone(),
                ),
                None => self.study_for(&study_path, &subject_id)?,
            };
            let series_tags = match &target.series {
                Some(tags) => tags.clone(),
                None => self.series_for(&series_path, &target_study)?,
            };

            let mut overrides = TagSet::new().with(Tag::PatientID, subject_id.as_str());
            overrides.apply(&study_tags);
            overrides.apply(&series_tags);

            let paths = self.index.image_paths(&series_path);
            self.jobs.extend(paths.into_iter().map(|source| Job {
                source,
                overrides: overrides.clone(),
            }));
        }
        Ok(())
    }

    pub(crate) fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }

    fn series_below(&self, source: &IdPath) -> Vec<IdPath> {
        match source.level() {
            Level::Series => vec![source.clone()],
            _ => self
                .index
                .children(source)
                .iter()
                .filter_map(|child| source.child(child.id()))
                .flat_map(|child| self.series_below(&child))
                .collect(),
        }
    }

    fn uid_for(&self, path: &IdPath) -> String {
        let uid = self
            .index
            .find(path)
            .and_then(|id| self.index.node(id))
            .map(|node| node.uid().to_string())
            .unwrap_or_default();
        if self.fresh_uids || uid.is_empty() {
            IdGenerator::generate_uid(&uid)
        } else {
            uid
        }
    }

    fn claim(&mut self, parent: &IdPath, ordinal: &str, description: &str) -> Result<String> {
        let index = self.index;
        let reserved = self.reserved.entry(parent.clone()).or_default();
        let description = IdGenerator::resolve_description(Some(ordinal), description, self.suffix, |id| {
            reserved.iter().any(|r| r == id)
                || parent
                    .child(id)
                    .is_some_and(|path| !index.image_paths(&path).is_empty())
        })?;
        reserved.push(IdGenerator::compose(ordinal, &description));
        Ok(description)
    }

    fn study_for(&mut self, source: &IdPath, subject_id: &str) -> Result<(IdPath, TagSet)> {
        let key = (source.clone(), subject_id.to_string());
        if let Some(planned) = self.studies.get(&key) {
            return Ok(planned.clone());
        }
        let mut parts = source.id().splitn(3, '_');
        let date = parts.next().unwrap_or_default().to_string();
        let time = parts.next().unwrap_or_default().to_string();
        let description = parts.next().unwrap_or_default().to_string();

        let subject = IdPath::subject(subject_id);
        let description = self.claim(&subject, &format!("{date}_{time}"), &description)?;
        let tags = TagSet::new()
            .with(Tag::StudyDate, date)
            .with(Tag::StudyTime, time)
            .with(Tag::StudyDescription, description)
            .with(Tag::StudyInstanceUID, self.uid_for(source));
        let planned = (IdPath::study(subject_id, IdGenerator::study_id(&tags)), tags);
        self.studies.insert(key, planned.clone());
        Ok(planned)
    }

    fn series_for(&mut self, source: &IdPath, target_study: &IdPath) -> Result<TagSet> {
        let key = (source.clone(), target_study.clone());
        if let Some(planned) = self.series.get(&key) {
            return Ok(planned.clone());
        }
        let (number, description) = series_parts(source.id());
        let description = self.claim(target_study, &number, &description)?;
        let tags = series_tags(&number, &description, &self.uid_for(source));
        self.series.insert(key, tags.clone());
        Ok(tags)
    }
}

impl Target {
    /// Overrides placing an image exactly at this target. Levels left
    /// `None` contribute nothing.
    pub(crate) fn overrides(&self) -> TagSet {
        let mut overrides = TagSet::new();
        if let Some(subject) = &self.subject {
            overrides.insert(Tag::PatientID, subject.as_str());
        }
        for tags in [&self.study, &self.series].into_iter().flatten() {
            overrides.apply(tags);
        }
        overrides
    }
}

/// Study tags that reproduce `study_id` under the given UID.
pub(crate) fn study_tags(study_id: &str, uid: &str) -> TagSet {
    let mut parts = study_id.splitn(3, '_');
    TagSet::new()
        .with(Tag::StudyDate, parts.next().unwrap_or_default())
        .with(Tag::StudyTime, parts.next().unwrap_or_default())
        .with(Tag::StudyDescription, parts.next().unwrap_or_default())
        .with(Tag::StudyInstanceUID, uid)
}

/// `indexed` equals `derived`, or extends it with collision suffixes that
/// keep apart nodes whose UIDs differ.
fn same_description(indexed: &str, derived: &str, uid_matches: bool) -> bool {
    indexed == derived || (uid_matches && indexed.starts_with(derived))
}

pub(crate) fn series_parts(series_id: &str) -> (String, String) {
    match series_id.split_once('_') {
        Some((number, description)) => (number.to_string(), description.to_string()),
        None => ("0".to_string(), series_id.to_string()),
    }
}

pub(crate) fn series_tags(number: &str, description: &str, uid: &str) -> TagSet {
    TagSet::new()
        .with(Tag::SeriesNumber, number)
        .with(Tag::SeriesDescription, description)
        .with(Tag::SeriesInstanceUID, uid)
}
