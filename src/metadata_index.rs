//! The persistent Subject → Study → Series → Image index.
//!
//! Nodes live in an arena (`Vec<Option<Node>>`) and are addressed by
//! [`NodeId`]. Two maps give direct access without walking the tree:
//! composite-ID paths for subjects, studies and series, and file paths for
//! images. Removed slots are recycled through a free list; ids of live
//! nodes never shift.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::DEFAULT_COLLISION_SUFFIX;
use crate::enums::Level;
use crate::error::Result;
use crate::id_generator::IdGenerator;
use crate::tag::{Dataset, Tag};
use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Composite-ID path of a subject, study or series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdPath(Vec<String>);

impl IdPath {
    pub fn subject(subject_id: impl Into<String>) -> Self {
        IdPath(vec![subject_id.into()])
    }

    pub fn study(subject_id: impl Into<String>, study_id: impl Into<String>) -> Self {
        IdPath(vec![subject_id.into(), study_id.into()])
    }

    pub fn series(
        subject_id: impl Into<String>,
        study_id: impl Into<String>,
        series_id: impl Into<String>,
    ) -> Self {
        IdPath(vec![subject_id.into(), study_id.into(), series_id.into()])
    }

    /// Path of a child node. Series paths have no children.
    pub fn child(&self, id: impl Into<String>) -> Option<Self> {
        if self.0.len() >= 3 {
            return None;
        }
        let mut components = self.0.clone();
        components.push(id.into());
        Some(IdPath(components))
    }

    pub fn parent(&self) -> Option<Self> {
        (self.0.len() > 1).then(|| IdPath(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn level(&self) -> Level {
        match self.0.len() {
            1 => Level::Subject,
            2 => Level::Study,
            _ => Level::Series,
        }
    }

    /// The ID of the node this path points at.
    pub fn id(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn subject_id(&self) -> &str {
        &self.0[0]
    }

    pub fn study_id(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn series_id(&self) -> Option<&str> {
        self.0.get(2).map(String::as_str)
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for IdPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// The `<label>`, `<name>`, `<time>` and `<date>` of an image leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageEntry {
    pub label: String,
    pub path: PathBuf,
    pub time: String,
    pub date: String,
}

#[derive(Debug, Clone)]
pub struct Node {
    level: Level,
    id: String,
    type_id: String,
    uid: String,
    checked: bool,
    image: Option<ImageEntry>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub(crate) fn branch(level: Level, id: &str, type_id: &str, uid: &str, checked: bool) -> Self {
        Self {
            level,
            id: id.to_string(),
            type_id: type_id.to_string(),
            uid: uid.to_string(),
            checked,
            image: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub(crate) fn leaf(entry: ImageEntry, checked: bool) -> Self {
        Self {
            level: Level::Image,
            id: String::new(),
            type_id: String::new(),
            uid: String::new(),
            checked,
            image: Some(entry),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Composite ID. Empty for image leaves, which are keyed by path.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn checked(&self) -> bool {
        self.checked
    }

    pub fn image(&self) -> Option<&ImageEntry> {
        self.image.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Everything needed to file one image into the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub subject_id: String,
    pub study_id: String,
    pub series_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub entry: ImageEntry,
    /// Derivation suffix recorded as `typeID` on newly created nodes.
    pub type_id: String,
}

impl ImageRecord {
    pub fn from_tags(path: impl Into<PathBuf>, tags: &impl Dataset, type_id: &str) -> Self {
        let path = path.into();
        let label = tags
            .text(Tag::InstanceNumber)
            .map(|number| format!("Image {number}"))
            .or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        Self {
            subject_id: IdGenerator::subject_id(tags),
            study_id: IdGenerator::study_id(tags),
            series_id: IdGenerator::series_id(tags),
            study_uid: tags.text(Tag::StudyInstanceUID).unwrap_or_default().to_string(),
            series_uid: tags.text(Tag::SeriesInstanceUID).unwrap_or_default().to_string(),
            entry: ImageEntry {
                label,
                path,
                time: tags.text(Tag::AcquisitionTime).unwrap_or_default().to_string(),
                date: tags.text(Tag::AcquisitionDate).unwrap_or_default().to_string(),
            },
            type_id: type_id.to_string(),
        }
    }

    pub fn series_path(&self) -> IdPath {
        IdPath::series(&self.subject_id, &self.study_id, &self.series_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    location: PathBuf,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    roots: Vec<NodeId>,
    by_path: HashMap<IdPath, NodeId>,
    by_file: HashMap<PathBuf, NodeId>,
    collision_suffix: String,
}

impl MetadataIndex {
    /// An empty index that will be saved to `location`.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    /// Load a persisted index.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Parse` if it is not a valid index
    /// document. Either way the caller should rebuild from disk.
    pub fn load(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref();
        let text = fs::read_to_string(location)?;
        xml::read(&text, location)
    }

    /// Serialize to the index location via a temporary file and an atomic rename.
    pub fn save(&self) -> Result<()> {
        let bytes = xml::write(self)?;
        let dir = match self.location.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::Write::write_all(&mut temp, &bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.location).map_err(|e| e.error)?;
        debug!(location = %self.location.display(), images = self.by_file.len(), "index saved");
        Ok(())
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn set_location(&mut self, location: impl Into<PathBuf>) {
        self.location = location.into();
    }

    /// Suffix appended to a study or series ID when a file's UID differs
    /// from the UID of the node already holding that ID.
    pub fn set_collision_suffix(&mut self, suffix: impl Into<String>) {
        self.collision_suffix = suffix.into();
    }

    fn collision_suffix(&self) -> &str {
        match self.collision_suffix.as_str() {
            "" => DEFAULT_COLLISION_SUFFIX,
            suffix => suffix,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.by_file.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn subjects(&self) -> &[NodeId] {
        &self.roots
    }

    /// Exact-match lookup by composite-ID path.
    pub fn find(&self, path: &IdPath) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn node_at(&self, path: &IdPath) -> Option<&Node> {
        self.find(path).and_then(|id| self.node(id))
    }

    pub fn find_image(&self, path: &Path) -> Option<NodeId> {
        self.by_file.get(path).copied()
    }

    pub fn contains(&self, path: &IdPath) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn contains_image(&self, path: &Path) -> bool {
        self.by_file.contains_key(path)
    }

    /// Child nodes of `path`, or an empty list when the path is absent.
    pub fn children(&self, path: &IdPath) -> Vec<&Node> {
        self.find(path)
            .and_then(|id| self.node(id))
            .map(|node| node.children.iter().filter_map(|&c| self.node(c)).collect())
            .unwrap_or_default()
    }

    /// Every image file below `path`, in document order.
    pub fn image_paths(&self, path: &IdPath) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(id) = self.find(path) {
            self.collect_images(id, &mut paths);
        }
        paths
    }

    pub fn all_image_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for &root in &self.roots {
            self.collect_images(root, &mut paths);
        }
        paths
    }

    fn collect_images(&self, id: NodeId, paths: &mut Vec<PathBuf>) {
        let Some(node) = self.node(id) else { return };
        if let Some(entry) = &node.image {
            paths.push(entry.path.clone());
        }
        for &child in &node.children {
            self.collect_images(child, paths);
        }
    }

    /// Composite-ID path of a branch node, or of the series holding an image.
    pub fn path_of(&self, id: NodeId) -> Option<IdPath> {
        let mut node = self.node(id)?;
        if node.level == Level::Image {
            node = self.node(node.parent?)?;
        }
        let mut components = vec![node.id.clone()];
        while let Some(parent) = node.parent {
            node = self.node(parent)?;
            components.push(node.id.clone());
        }
        components.reverse();
        Some(IdPath(components))
    }

    /// Series path of the image stored at `path`.
    pub fn series_of(&self, path: &Path) -> Option<IdPath> {
        self.path_of(self.find_image(path)?)
    }

    pub fn set_checked(&mut self, id: NodeId, checked: bool) -> bool {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => {
                node.checked = checked;
                true
            }
            None => false,
        }
    }

    /// Replace the UID recorded on the study or series at `path`.
    pub(crate) fn set_uid(&mut self, path: &IdPath, uid: &str) -> bool {
        let Some(id) = self.find(path) else { return false };
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => {
                node.uid = uid.to_string();
                true
            }
            None => false,
        }
    }

    /// File an image, creating any missing subject, study and series nodes.
    ///
    /// Returns the series ID actually used. An existing study or series is
    /// reused unless its UID differs from the record's, in which case the
    /// collision suffix is appended to the ID. An existing series is also
    /// passed over when its `typeID` differs from a non-empty record
    /// `typeID`; the record's `typeID` is then appended instead. Re-inserting
    /// an already indexed path moves it.
    pub fn insert_image(&mut self, record: ImageRecord) -> String {
        self.file_image(record, false, false)
    }

    /// Re-key the image at `record.entry.path` to the record's ID path in one
    /// step. The image joins the target series whatever its `typeID`; the
    /// old ancestors are pruned only after the image is attached, so the
    /// index is never observed half-updated.
    ///
    /// Returns `None` when the path is not indexed.
    pub fn move_image(&mut self, record: ImageRecord) -> Option<String> {
        if !self.by_file.contains_key(&record.entry.path) {
            return None;
        }
        Some(self.file_image(record, true, true))
    }

    /// File an image at exactly the record's IDs, joining an existing series
    /// whatever its `typeID`. Used once names have been made collision-free.
    pub(crate) fn file_planned(&mut self, record: ImageRecord) -> String {
        self.file_image(record, true, false)
    }

    fn file_image(&mut self, mut record: ImageRecord, join_existing: bool, keep_checked: bool) -> String {
        let previous = self.by_file.get(&record.entry.path).copied();
        let checked = previous
            .and_then(|id| self.node(id))
            .is_some_and(|node| node.checked && keep_checked);
        let old_parent = previous.and_then(|leaf| self.detach(leaf));

        let subject_path = IdPath::subject(&record.subject_id);
        let subject = self.ensure_branch(None, subject_path.clone(), "", "");
        let study_id = self.slot(&subject_path, &mut record, Level::Study, join_existing);
        record.study_id = study_id;
        let study_path = IdPath::study(&record.subject_id, &record.study_id);
        let study = self.ensure_branch(Some(subject), study_path.clone(), &record.type_id, &record.study_uid);

        let series_id = self.slot(&study_path, &mut record, Level::Series, join_existing);
        let series_path = IdPath::series(&record.subject_id, &record.study_id, &series_id);
        let series = self.ensure_branch(Some(study), series_path, &record.type_id, &record.series_uid);

        let path = record.entry.path.clone();
        let leaf = self.alloc(Node::leaf(record.entry, checked));
        self.attach(series, leaf);
        self.by_file.insert(path, leaf);

        if let Some(parent) = old_parent {
            self.prune(parent);
        }
        series_id
    }

    /// The study or series ID under `parent` that the record may join.
    fn slot(&self, parent: &IdPath, record: &mut ImageRecord, level: Level, join_existing: bool) -> String {
        let (mut id, uid) = match level {
            Level::Study => (record.study_id.clone(), record.study_uid.clone()),
            _ => (record.series_id.clone(), record.series_uid.clone()),
        };
        loop {
            let Some(node) = parent.child(&id).and_then(|path| self.node_at(&path)) else {
                return id;
            };
            if join_existing {
                if level == Level::Series {
                    record.type_id = node.type_id.clone();
                }
                return id;
            }
            let uid_differs = !uid.is_empty() && !node.uid.is_empty() && node.uid != uid;
            let type_differs =
                level == Level::Series && !record.type_id.is_empty() && node.type_id != record.type_id;
            if !uid_differs && !type_differs {
                return id;
            }
            let suffix = match record.type_id.as_str() {
                "" => self.collision_suffix(),
                type_id => type_id,
            };
            id.push_str(suffix);
        }
    }

    /// Remove the image at `path` and cascade upward: an emptied series is
    /// removed, then an emptied study, then an emptied subject.
    pub fn remove(&mut self, path: &Path) -> Option<ImageEntry> {
        let leaf = self.by_file.get(path).copied()?;
        let entry = self.node(leaf).and_then(|node| node.image.clone());
        if let Some(parent) = self.detach(leaf) {
            self.prune(parent);
        }
        entry
    }

    pub(crate) fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Number of arena slots in use or waiting for reuse.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(child.0).and_then(Option::as_mut) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(parent.0).and_then(Option::as_mut) {
            node.children.push(child);
        }
    }

    /// Find or create the branch node at `path`. Used by both the document
    /// reader and `insert_image`.
    pub(crate) fn ensure_branch(
        &mut self,
        parent: Option<NodeId>,
        path: IdPath,
        type_id: &str,
        uid: &str,
    ) -> NodeId {
        self.ensure_branch_checked(parent, path, type_id, uid, false)
    }

    pub(crate) fn ensure_branch_checked(
        &mut self,
        parent: Option<NodeId>,
        path: IdPath,
        type_id: &str,
        uid: &str,
        checked: bool,
    ) -> NodeId {
        if let Some(&existing) = self.by_path.get(&path) {
            return existing;
        }
        let node = self.alloc(Node::branch(path.level(), path.id(), type_id, uid, checked));
        match parent {
            Some(parent) => self.attach(parent, node),
            None => self.roots.push(node),
        }
        self.by_path.insert(path, node);
        node
    }

    pub(crate) fn push_image(&mut self, series: NodeId, entry: ImageEntry, checked: bool) -> bool {
        if self.by_file.contains_key(&entry.path) {
            return false;
        }
        let path = entry.path.clone();
        let leaf = self.alloc(Node::leaf(entry, checked));
        self.attach(series, leaf);
        self.by_file.insert(path, leaf);
        true
    }

    /// Unlink an image leaf and free its slot. Returns its former parent.
    fn detach(&mut self, leaf: NodeId) -> Option<NodeId> {
        let node = self.nodes.get_mut(leaf.0)?.take()?;
        self.free.push(leaf.0);
        if let Some(entry) = &node.image {
            self.by_file.remove(&entry.path);
        }
        let parent = node.parent?;
        if let Some(parent_node) = self.nodes.get_mut(parent.0).and_then(Option::as_mut) {
            parent_node.children.retain(|&child| child != leaf);
        }
        Some(parent)
    }

    /// Drop every subject, study and series that holds no images.
    pub(crate) fn prune_empty_branches(&mut self) {
        let empty: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|node| (NodeId(slot), node)))
            .filter(|(_, node)| node.level != Level::Image && node.children.is_empty())
            .map(|(id, _)| id)
            .collect();
        for id in empty {
            self.prune(id);
        }
    }

    /// Remove `id` and its ancestors for as long as they are left empty.
    fn prune(&mut self, mut id: NodeId) {
        loop {
            let Some(node) = self.node(id) else { return };
            if !node.children.is_empty() {
                return;
            }
            let parent = node.parent;
            if let Some(path) = self.path_of(id) {
                debug!(%path, "removing empty node");
                self.by_path.remove(&path);
            }
            self.nodes[id.0] = None;
            self.free.push(id.0);
            match parent {
                Some(parent) => {
                    if let Some(parent_node) = self.nodes.get_mut(parent.0).and_then(Option::as_mut) {
                        parent_node.children.retain(|&child| child != id);
                    }
                    id = parent;
                }
                None => {
                    self.roots.retain(|&root| root != id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject: &str, study: &str, series: &str, file: &str) -> ImageRecord {
        ImageRecord {
            subject_id: subject.to_string(),
            study_id: study.to_string(),
            series_id: series.to_string(),
            study_uid: "1.2.3".to_string(),
            series_uid: "1.2.3.4".to_string(),
            entry: ImageEntry {
                label: file.to_string(),
                path: PathBuf::from(format!("/data/{file}")),
                time: String::new(),
                date: String::new(),
            },
            type_id: String::new(),
        }
    }

    fn scenario_a() -> MetadataIndex {
        let mut index = MetadataIndex::new("/data.xml");
        index.insert_image(record("P1", "20240101_120000_MR", "1_T1w", "a.dcm"));
        index.insert_image(record("P1", "20240101_120000_MR", "1_T1w", "b.dcm"));
        index
    }

    #[test]
    fn insert_adds_exactly_one_image() {
        let mut index = scenario_a();
        let series = IdPath::series("P1", "20240101_120000_MR", "1_T1w");
        let before = index.children(&series).len();

        let used = index.insert_image(record("P1", "20240101_120000_MR", "1_T1w", "c.dcm"));

        assert_eq!(used, "1_T1w");
        assert_eq!(index.children(&series).len(), before + 1);
        assert!(index.find_image(Path::new("/data/c.dcm")).is_some());
    }

    #[test]
    fn insert_creates_missing_ancestors() {
        let mut index = MetadataIndex::new("/data.xml");
        index.insert_image(record("P2", "20240202_080000_CT", "3_Flair", "x.dcm"));

        assert!(index.contains(&IdPath::subject("P2")));
        assert!(index.contains(&IdPath::study("P2", "20240202_080000_CT")));
        let series = index
            .find(&IdPath::series("P2", "20240202_080000_CT", "3_Flair"))
            .and_then(|id| index.node(id))
            .expect("series should exist");
        assert_eq!(series.uid(), "1.2.3.4");
        assert_eq!(series.level(), Level::Series);
    }

    #[test]
    fn scenario_a_cascade() {
        let mut index = scenario_a();
        let series = IdPath::series("P1", "20240101_120000_MR", "1_T1w");

        assert!(index.remove(Path::new("/data/a.dcm")).is_some());
        assert_eq!(index.image_paths(&series), vec![PathBuf::from("/data/b.dcm")]);

        assert!(index.remove(Path::new("/data/b.dcm")).is_some());
        assert!(!index.contains(&series));
        assert!(!index.contains(&IdPath::study("P1", "20240101_120000_MR")));
        assert!(!index.contains(&IdPath::subject("P1")));
        assert!(index.is_empty());
    }

    #[test]
    fn cascade_stops_at_non_empty_ancestor() {
        let mut index = scenario_a();
        index.insert_image(record("P1", "20240101_120000_MR", "2_T2w", "t2.dcm"));

        index.remove(Path::new("/data/t2.dcm"));

        assert!(!index.contains(&IdPath::series("P1", "20240101_120000_MR", "2_T2w")));
        assert!(index.contains(&IdPath::study("P1", "20240101_120000_MR")));
    }

    #[test]
    fn lookup_miss_is_none() {
        let mut index = scenario_a();
        assert!(index.find(&IdPath::subject("nobody")).is_none());
        assert!(index.children(&IdPath::subject("nobody")).is_empty());
        assert!(index.remove(Path::new("/data/missing.dcm")).is_none());
    }

    #[test]
    fn type_id_mismatch_gets_a_new_series_slot() {
        let mut index = scenario_a();
        let mut derived = record("P1", "20240101_120000_MR", "1_T1w", "a_copy.dcm");
        derived.type_id = "_copy".to_string();

        let used = index.insert_image(derived.clone());
        assert_eq!(used, "1_T1w_copy");

        derived.entry.path = PathBuf::from("/data/a_copy2.dcm");
        assert_eq!(index.insert_image(derived), "1_T1w_copy");
        assert_eq!(
            index
                .image_paths(&IdPath::series("P1", "20240101_120000_MR", "1_T1w_copy"))
                .len(),
            2
        );
    }

    #[test]
    fn move_relocates_and_prunes() {
        let mut index = scenario_a();
        let mut moved = record("P9", "20240101_120000_MR", "1_T1w", "a.dcm");
        moved.series_uid = "9.9".to_string();

        assert_eq!(index.move_image(moved), Some("1_T1w".to_string()));
        assert_eq!(index.image_count(), 2);
        assert_eq!(
            index.series_of(Path::new("/data/a.dcm")),
            Some(IdPath::series("P9", "20240101_120000_MR", "1_T1w"))
        );

        let moved = record("P9", "20240101_120000_MR", "1_T1w", "b.dcm");
        index.move_image(moved);
        assert!(!index.contains(&IdPath::subject("P1")));
        assert_eq!(index.subjects().len(), 1);
    }

    #[test]
    fn move_of_unknown_path_is_none() {
        let mut index = scenario_a();
        assert_eq!(index.move_image(record("P1", "s", "x", "zzz.dcm")), None);
        assert_eq!(index.image_count(), 2);
    }

    #[test]
    fn moving_within_the_same_series_keeps_it() {
        let mut index = MetadataIndex::new("/data.xml");
        index.insert_image(record("P1", "s", "1_A", "only.dcm"));
        index.move_image(record("P1", "s", "1_A", "only.dcm"));
        assert_eq!(
            index.image_paths(&IdPath::series("P1", "s", "1_A")),
            vec![PathBuf::from("/data/only.dcm")]
        );
    }

    #[test]
    fn a_different_uid_under_a_taken_id_gets_its_own_node() {
        let mut index = scenario_a();

        let mut other_series = record("P1", "20240101_120000_MR", "1_T1w", "c.dcm");
        other_series.series_uid = "1.2.3.9".to_string();
        assert_eq!(index.insert_image(other_series), "1_T1w_1");

        let mut other_study = record("P1", "20240101_120000_MR", "1_T1w", "d.dcm");
        other_study.study_uid = "1.2.8".to_string();
        other_study.series_uid = "1.2.8.1".to_string();
        assert_eq!(index.insert_image(other_study), "1_T1w");

        let moved_study = IdPath::study("P1", "20240101_120000_MR_1");
        assert_eq!(index.node_at(&moved_study).map(Node::uid), Some("1.2.8"));
        assert_eq!(
            index.image_paths(&IdPath::series("P1", "20240101_120000_MR", "1_T1w")).len(),
            2
        );
    }

    #[test]
    fn an_empty_uid_joins_the_existing_node() {
        let mut index = scenario_a();
        let mut anonymous = record("P1", "20240101_120000_MR", "1_T1w", "c.dcm");
        anonymous.series_uid.clear();
        assert_eq!(index.insert_image(anonymous), "1_T1w");
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut index = scenario_a();
        let before = index.capacity();

        for round in 0..50 {
            let subject = if round % 2 == 0 { "P9" } else { "P1" };
            index.move_image(record(subject, "20240101_120000_MR", "1_T1w", "a.dcm"));
        }

        assert_eq!(index.image_count(), 2);
        assert!(index.capacity() <= before + 3, "arena grew to {}", index.capacity());
    }

    #[test]
    fn id_path_navigation() {
        let series = IdPath::series("P1", "S", "1_T1w");
        assert_eq!(series.level(), Level::Series);
        assert_eq!(series.id(), "1_T1w");
        assert_eq!(series.parent(), Some(IdPath::study("P1", "S")));
        assert!(series.child("x").is_none());
        assert_eq!(IdPath::subject("P1").parent(), None);
        assert_eq!(series.to_string(), "P1/S/1_T1w");
    }
}
