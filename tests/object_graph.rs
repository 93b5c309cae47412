use std::path::{Path, PathBuf};

use dicom_index::{
    BatchReport, CancelFlag, Database, Dataset, FileStore, IdPath, ImageRecord, IndexConfig, IndexError,
    MemoryFileStore, MetadataIndex, NoProgress, ProgressSink, Series, SeriesState, SortBy, Study, Subject, Tag,
    TagSet,
};
use ndarray::Array2;

const STUDY: &str = "20240101_120000_MR";
const STUDY_UID: &str = "1.2.826.0.1.3680043.10.1";

fn image_tags(patient: &str, number: &str, description: &str, instance: usize, z: f64) -> TagSet {
    TagSet::new()
        .with(Tag::PatientID, patient)
        .with(Tag::StudyDate, "20240101")
        .with(Tag::StudyTime, "120000.123")
        .with(Tag::StudyDescription, "MR")
        .with(Tag::StudyInstanceUID, STUDY_UID)
        .with(Tag::SeriesNumber, number)
        .with(Tag::SeriesDescription, description)
        .with(Tag::SeriesInstanceUID, format!("{STUDY_UID}.{number}"))
        .with(Tag::SOPInstanceUID, format!("{STUDY_UID}.{number}.{instance}"))
        .with(Tag::InstanceNumber, instance.to_string())
        .with(Tag::Rows, "4")
        .with(Tag::Columns, "4")
        .with(Tag::ImageOrientationPatient, "1\\0\\0\\0\\1\\0")
        .with(Tag::PixelSpacing, "1\\1")
        .with(Tag::SliceThickness, "1")
        .with(Tag::ImagePositionPatient, format!("0\\0\\{z}"))
}

/// Subject `P1`, study `20240101_120000_MR`, series `1_T1w` with two images
/// and `2_T1w` with three.
fn fixture() -> Database<MemoryFileStore> {
    let store = MemoryFileStore::new();
    let mut index = MetadataIndex::new("/data.xml");
    let files = [
        ("a", "1", 1, 1.0),
        ("b", "1", 2, 0.0),
        ("c", "2", 1, 0.0),
        ("d", "2", 2, 1.0),
        ("e", "2", 3, 2.0),
    ];
    for (name, number, instance, z) in files {
        let path = PathBuf::from(format!("/data/{name}.dcm"));
        let tags = image_tags("P1", number, "T1w", instance, z);
        index.insert_image(ImageRecord::from_tags(&path, &tags, ""));
        store.insert(path, tags);
    }
    Database::new(index, store, IndexConfig::default())
}

fn series(db: &Database<MemoryFileStore>, id: &str) -> Series {
    study(db)
        .series(db)
        .into_iter()
        .find(|series| series.id() == id)
        .unwrap()
}

fn study(db: &Database<MemoryFileStore>) -> Study {
    db.subject("P1").unwrap().studies(db).remove(0)
}

fn count(db: &Database<MemoryFileStore>, path: &IdPath) -> usize {
    db.index().image_paths(path).len()
}

/// UIDs of every study and series node, in tree order.
fn node_uids(db: &Database<MemoryFileStore>) -> Vec<String> {
    let mut uids = Vec::new();
    for subject in db.subjects() {
        for study in subject.studies(db) {
            uids.push(study.uid().to_string());
            uids.extend(study.series(db).iter().map(|series| series.uid().to_string()));
        }
    }
    uids
}

fn assert_unique_uids(db: &Database<MemoryFileStore>) {
    let mut uids = node_uids(db);
    let total = uids.len();
    uids.sort();
    uids.dedup();
    assert_eq!(uids.len(), total, "duplicate node uids in {:?}", node_uids(db));
}

/// Cancels once `limit` items have started.
struct CancelAfter {
    started: usize,
    limit: usize,
}

impl ProgressSink for CancelAfter {
    fn progress(&mut self, _max: usize, _index: usize, _message: &str) {
        self.started += 1;
    }

    fn update(&mut self, _index: usize) {}

    fn close(&mut self) {}

    fn is_cancelled(&self) -> bool {
        self.started >= self.limit
    }
}

#[test]
fn scenario_b_merge_copies_and_keeps_originals() {
    let mut db = fixture();
    let sources = [series(&db, "1_T1w"), series(&db, "2_T1w")];

    let (merged, report) = Series::merge(&mut db, &sources, "99_Merged", &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(merged.id(), "99_Merged");
    assert_eq!(count(&db, &merged.path()), 5);
    assert_eq!(count(&db, &sources[0].path()), 2);
    assert_eq!(count(&db, &sources[1].path()), 3);
    assert_eq!(db.store().len(), 10);
    assert!(db.verify().is_empty());

    let uids: Vec<_> = merged
        .image_paths(&db)
        .iter()
        .map(|path| db.store().read_tag(path, Tag::SeriesInstanceUID).unwrap())
        .collect();
    assert!(uids.iter().all(|uid| uid.as_deref() == Some(merged.uid())));
    assert_ne!(merged.uid(), sources[0].uid());
}

#[test]
fn merge_move_relocates_and_removes_the_sources() {
    let mut db = fixture();
    let sources = [series(&db, "1_T1w"), series(&db, "2_T1w")];

    let (merged, report) = Series::merge_move(&mut db, &sources, "99_Merged", &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(count(&db, &merged.path()), 5);
    assert!(!db.index().contains(&sources[0].path()));
    assert!(!db.index().contains(&sources[1].path()));
    assert_eq!(db.store().len(), 5);
    assert_eq!(sources[0].state(&db), SeriesState::Unbound);
    assert!(db.verify().is_empty());
}

#[test]
fn merge_without_a_number_keeps_the_first_series_number() {
    let mut db = fixture();
    let sources = [series(&db, "2_T1w"), series(&db, "1_T1w")];
    let (merged, _) = Series::merge(&mut db, &sources, "Combined", &mut NoProgress).unwrap();
    assert_eq!(merged.id(), "2_Combined");
}

#[test]
fn merging_into_a_taken_name_appends_the_collision_suffix() {
    let mut db = fixture();
    let sources = [series(&db, "1_T1w")];
    let (merged, _) = Series::merge(&mut db, &sources, "2_T1w", &mut NoProgress).unwrap();
    assert_eq!(merged.id(), "2_T1w_1");
    assert_eq!(count(&db, &series(&db, "2_T1w").path()), 3);
}

#[test]
fn series_copy_gets_new_names_files_and_uids() {
    let mut db = fixture();
    let source = series(&db, "1_T1w");

    let (copy, report) = source.copy(&mut db, "_copy", None, &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(copy.id(), "1_T1w_copy");
    assert_eq!(copy.suffix(), "_copy");
    let paths = copy.image_paths(&db);
    assert_eq!(paths, vec![PathBuf::from("/data/a_copy.dcm"), PathBuf::from("/data/b_copy.dcm")]);
    assert!(paths.iter().all(|path| !source.image_paths(&db).contains(path)));

    let node = db.index().node_at(&copy.path()).unwrap();
    assert_eq!(node.type_id(), "_copy");
    assert_eq!(node.uid(), copy.uid());
    let original_sop = db.store().read_tag(Path::new("/data/a.dcm"), Tag::SOPInstanceUID).unwrap();
    let copied_sop = db.store().read_tag(&paths[0], Tag::SOPInstanceUID).unwrap();
    assert_ne!(original_sop, copied_sop);
    assert!(db.verify().is_empty());

    // A second copy with the same suffix resolves the collision.
    let (again, _) = source.copy(&mut db, "_copy", None, &mut NoProgress).unwrap();
    assert_eq!(again.id(), "1_T1w_copy_copy");
}

#[test]
fn study_copy_into_another_subject() {
    let mut db = fixture();
    let source = study(&db);
    let target = db.subject("P1").unwrap().new_sibling(&db, "_anon").unwrap();
    assert_eq!(target.id(), "P1_anon");
    assert!(!target.is_bound(&db));

    let (copy, report) = source.copy(&mut db, "", Some(&target), &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(copy.subject_id(), "P1_anon");
    assert_eq!(copy.id(), STUDY);
    assert_ne!(copy.uid(), STUDY_UID);
    assert_eq!(count(&db, &copy.path()), 5);
    assert_eq!(copy.series(&db).len(), 2);
    assert!(target.is_bound(&db));
    assert!(db.verify().is_empty());
}

#[test]
fn copy_with_empty_suffix_onto_itself_is_rejected() {
    let mut db = fixture();
    let source = study(&db);
    let result = source.copy(&mut db, "", None, &mut NoProgress);
    assert!(matches!(result, Err(IndexError::EmptySuffix(_))));
    assert_eq!(db.store().len(), 5);
}

#[test]
fn subject_copy_and_merge() {
    let mut db = fixture();
    let p1 = db.subject("P1").unwrap();

    let (copy, report) = p1.copy(&mut db, "_copy", &mut NoProgress).unwrap();
    assert!(report.is_complete());
    assert_eq!(copy.id(), "P1_copy");
    assert_eq!(copy.images(&db).len(), 5);

    let (merged, report) = Subject::merge(&mut db, &[p1.clone(), copy.clone()], "Pooled", &mut NoProgress).unwrap();
    assert!(report.is_complete());
    assert_eq!(merged.id(), "Pooled");
    assert_eq!(merged.images(&db).len(), 10);
    // Both sources had the same study, so the second one is renamed.
    let studies: Vec<String> = merged.studies(&db).iter().map(|s| s.id().to_string()).collect();
    assert_eq!(studies, vec![STUDY.to_string(), format!("{STUDY}_1")]);
    assert!(db.verify().is_empty());
}

#[test]
fn study_merge_move_renames_colliding_series() {
    let mut db = fixture();
    let (copy, _) = study(&db).copy(&mut db, "_b", None, &mut NoProgress).unwrap();
    let sources = [study(&db), copy];

    let (merged, report) = Study::merge_move(&mut db, &sources, "Combined", &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(merged.id(), "20240101_120000_Combined");
    let series: Vec<String> = merged.series(&db).iter().map(|s| s.id().to_string()).collect();
    assert_eq!(series, vec!["1_T1w", "2_T1w", "1_T1w_1", "2_T1w_1"]);
    assert_eq!(db.subject("P1").unwrap().studies(&db).len(), 1);
    assert!(db.verify().is_empty());
}

#[test]
fn delete_cascades_and_clears_the_handle() {
    let mut db = fixture();
    let mut first = series(&db, "1_T1w");
    first.delete(&mut db, &mut NoProgress).unwrap();
    assert_eq!(first.state(&db), SeriesState::Deleted);
    assert!(db.index().contains(&study(&db).path()));

    let mut subject = db.subject("P1").unwrap();
    let report = subject.delete(&mut db, &mut NoProgress).unwrap();
    assert_eq!(report.succeeded.len(), 3);
    assert!(subject.is_deleted());
    assert!(db.index().is_empty());
    assert!(db.store().is_empty());

    assert!(matches!(subject.copy(&mut db, "_x", &mut NoProgress), Err(IndexError::Deleted)));
    assert!(matches!(first.get_value(&db, Tag::Modality), Err(IndexError::Deleted)));
}

#[test]
fn set_value_on_an_id_tag_relocates_images_and_handle() {
    let mut db = fixture();
    let mut target = series(&db, "1_T1w");
    let old = target.path();

    let report = target.set_value(&mut db, Tag::SeriesDescription, "T2w", &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(target.id(), "1_T2w");
    assert_eq!(count(&db, &target.path()), 2);
    assert!(!db.index().contains(&old));
    assert!(db.verify().is_empty());
}

#[test]
fn image_set_value_moves_it_to_another_subject() {
    let mut db = fixture();
    let mut image = db.image(Path::new("/data/c.dcm")).unwrap();

    image.set_value(&mut db, Tag::PatientID, "P9").unwrap();

    let parent = image.parent();
    assert_eq!(parent.subject_id(), "P9");
    assert_eq!(parent.study_id(), STUDY);
    assert_ne!(parent.study_uid(), STUDY_UID);
    assert_eq!(study(&db).uid(), STUDY_UID);
    assert_eq!(
        image.get_value(&db, Tag::StudyInstanceUID).unwrap().as_deref(),
        Some(parent.study_uid())
    );
    assert_eq!(count(&db, &series(&db, "2_T1w").path()), 2);
    assert_eq!(image.get_value(&db, Tag::PatientID).unwrap().as_deref(), Some("P9"));
    assert_unique_uids(&db);
    assert!(db.verify().is_empty());
}

#[test]
fn retagging_part_of_a_series_splits_off_a_new_uid() {
    let mut db = fixture();
    let old_uid = series(&db, "1_T1w").uid().to_string();
    let mut image = db.image(Path::new("/data/a.dcm")).unwrap();

    image.set_value(&mut db, Tag::SeriesDescription, "T2w").unwrap();

    let split = image.parent();
    assert_eq!(split.id(), "1_T2w");
    assert_ne!(split.uid(), old_uid);
    assert_eq!(series(&db, "1_T1w").uid(), old_uid);
    assert_eq!(
        db.store().read_tag(Path::new("/data/a.dcm"), Tag::SeriesInstanceUID).unwrap().as_deref(),
        Some(split.uid())
    );
    assert_unique_uids(&db);
    assert!(db.verify().is_empty());

    // The second image joins the split series and takes over its UID.
    let mut second = db.image(Path::new("/data/b.dcm")).unwrap();
    second.set_value(&mut db, Tag::SeriesDescription, "T2w").unwrap();
    assert_eq!(second.parent().uid(), split.uid());
    assert_eq!(count(&db, &split.path()), 2);
    assert_unique_uids(&db);
    assert!(db.verify().is_empty());
}

#[test]
fn the_last_image_leaving_a_series_keeps_its_uid() {
    let mut db = fixture();
    let mut first = series(&db, "1_T1w");
    first.delete(&mut db, &mut NoProgress).unwrap();
    db.image(Path::new("/data/c.dcm")).unwrap().delete(&mut db).unwrap();
    db.image(Path::new("/data/d.dcm")).unwrap().delete(&mut db).unwrap();
    let old_uid = series(&db, "2_T1w").uid().to_string();

    let mut last = db.image(Path::new("/data/e.dcm")).unwrap();
    last.set_value(&mut db, Tag::SeriesDescription, "Flair").unwrap();

    assert_eq!(last.parent().id(), "2_Flair");
    assert_eq!(last.parent().uid(), old_uid);
    assert!(db.verify().is_empty());
}

#[test]
fn retagging_into_an_existing_series_adopts_its_uid() {
    let mut db = fixture();
    let target_uid = series(&db, "1_T1w").uid().to_string();
    let mut image = db.image(Path::new("/data/c.dcm")).unwrap();

    image.set_value(&mut db, Tag::SeriesNumber, "1").unwrap();

    assert_eq!(image.parent().id(), "1_T1w");
    assert_eq!(count(&db, &series(&db, "1_T1w").path()), 3);
    assert_eq!(
        db.store().read_tag(Path::new("/data/c.dcm"), Tag::SeriesInstanceUID).unwrap().as_deref(),
        Some(target_uid.as_str())
    );
    assert_unique_uids(&db);
    assert!(db.verify().is_empty());
}

#[test]
fn a_failed_retag_leaves_that_image_where_it_was() {
    let mut db = fixture();
    db.store().fail_on("/data/b.dcm");
    let mut target = series(&db, "1_T1w");
    let old = target.path();

    let report = target.set_value(&mut db, Tag::SeriesDescription, "T2w", &mut NoProgress).unwrap();

    assert_eq!(report.succeeded, vec![PathBuf::from("/data/a.dcm")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, PathBuf::from("/data/b.dcm"));
    assert_eq!(db.index().image_paths(&old), vec![PathBuf::from("/data/b.dcm")]);
    assert_eq!(target.id(), "1_T2w");
    assert_eq!(target.image_paths(&db), vec![PathBuf::from("/data/a.dcm")]);
    assert_unique_uids(&db);
    db.verify_image(Path::new("/data/a.dcm")).unwrap();
}

#[test]
fn a_file_that_cannot_be_deleted_keeps_its_branch() {
    let mut db = fixture();
    db.store().fail_on("/data/d.dcm");
    let mut subject = db.subject("P1").unwrap();

    let report = subject.delete(&mut db, &mut NoProgress).unwrap();

    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, PathBuf::from("/data/d.dcm"));
    assert!(!subject.is_deleted());
    assert_eq!(subject.id(), "P1");
    assert!(db.index().contains(&IdPath::subject("P1")));
    assert!(db.index().contains(&IdPath::study("P1", STUDY)));
    assert_eq!(db.index().image_paths(&IdPath::series("P1", STUDY, "2_T1w")), vec![PathBuf::from("/data/d.dcm")]);
    assert!(!db.index().contains(&IdPath::series("P1", STUDY, "1_T1w")));
    assert_eq!(db.store().paths(), vec![PathBuf::from("/data/d.dcm")]);
}

#[test]
fn same_series_name_with_another_uid_is_not_drift() {
    let store = MemoryFileStore::new();
    let mut index = MetadataIndex::new("/data.xml");
    for (name, uid) in [("a", "1.2.3.4.5.6.1"), ("b", "1.2.3.4.5.6.99")] {
        let path = PathBuf::from(format!("/data/{name}.dcm"));
        let tags = image_tags("P1", "1", "T1w", 1, 0.0).with(Tag::SeriesInstanceUID, uid);
        index.insert_image(ImageRecord::from_tags(&path, &tags, ""));
        store.insert(path, tags);
    }
    let db = Database::new(index, store, IndexConfig::default());

    let ids: Vec<String> = study(&db).series(&db).iter().map(|s| s.id().to_string()).collect();
    assert_eq!(ids, vec!["1_T1w", "1_T1w_1"]);
    assert_unique_uids(&db);
    assert!(db.verify().is_empty());
}

#[test]
fn non_id_tags_are_written_without_moving() {
    let mut db = fixture();
    let mut target = series(&db, "2_T1w");
    target.set_value(&mut db, Tag::Modality, "CT", &mut NoProgress).unwrap();

    let values = target.get_value(&db, Tag::Modality).unwrap();
    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|(_, value)| value.as_ref().unwrap().as_deref() == Some("CT")));
    assert_eq!(target.id(), "2_T1w");
}

#[test]
fn cancellation_stops_between_images() {
    let mut db = fixture();
    let sources = [series(&db, "1_T1w"), series(&db, "2_T1w")];
    let mut sink = CancelAfter { started: 0, limit: 2 };

    let (merged, report) = Series::merge(&mut db, &sources, "99_Merged", &mut sink).unwrap();

    assert!(report.cancelled);
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(count(&db, &merged.path()), 2);
    assert_eq!(count(&db, &sources[1].path()), 3);
}

#[test]
fn cancel_flag_before_start_does_nothing() {
    let mut db = fixture();
    let flag = CancelFlag::new();
    flag.cancel();
    let mut sink = NoProgress;
    let mut guarded = flag.guard(&mut sink);

    let (_, report) = study(&db).copy(&mut db, "_c", None, &mut guarded).unwrap();

    assert!(report.cancelled);
    assert!(report.succeeded.is_empty());
    assert_eq!(db.store().len(), 5);
}

#[test]
fn failures_are_collected_and_the_batch_continues() {
    let mut db = fixture();
    db.store().fail_on("/data/d.dcm");
    let sources = [series(&db, "1_T1w"), series(&db, "2_T1w")];

    let (merged, report): (Series, BatchReport) =
        Series::merge(&mut db, &sources, "99_Merged", &mut NoProgress).unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, PathBuf::from("/data/d.dcm"));
    assert!(matches!(report.failed[0].1, IndexError::Store { .. }));
    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(count(&db, &merged.path()), 4);
}

#[test]
fn verify_reports_drift_between_index_and_files() {
    let db = fixture();
    db.store().write_tag(Path::new("/data/a.dcm"), Tag::PatientID, "Other").unwrap();

    let violations = db.verify();
    assert_eq!(violations.len(), 1);
    match &violations[0] {
        IndexError::ConsistencyViolation { path, tag, indexed, on_disk } => {
            assert_eq!(path, Path::new("/data/a.dcm"));
            assert_eq!(*tag, Tag::PatientID);
            assert_eq!(indexed, "P1");
            assert_eq!(on_disk.as_deref(), Some("Other"));
        }
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn verify_names_the_study_tag_that_drifted() {
    let db = fixture();
    db.store().write_tag(Path::new("/data/a.dcm"), Tag::StudyDate, "20230101").unwrap();
    db.store().write_tag(Path::new("/data/c.dcm"), Tag::StudyTime, "090000").unwrap();
    db.store().write_tag(Path::new("/data/e.dcm"), Tag::SeriesNumber, "5").unwrap();

    let drifted: Vec<(PathBuf, Tag, String)> = db
        .verify()
        .into_iter()
        .filter_map(|error| match error {
            IndexError::ConsistencyViolation { path, tag, indexed, .. } => Some((path, tag, indexed)),
            _ => None,
        })
        .collect();
    assert_eq!(
        drifted,
        vec![
            (PathBuf::from("/data/a.dcm"), Tag::StudyDate, "20240101".to_string()),
            (PathBuf::from("/data/c.dcm"), Tag::StudyTime, "120000".to_string()),
            (PathBuf::from("/data/e.dcm"), Tag::SeriesNumber, "2".to_string()),
        ]
    );
}

#[test]
fn sorted_images_follow_the_requested_key() {
    let db = fixture();
    let target = series(&db, "2_T1w");
    let names = |images: Vec<dicom_index::Image>| -> Vec<PathBuf> {
        images.iter().filter_map(|image| image.path().map(Path::to_path_buf)).collect()
    };

    let by_position = names(target.sorted_images(&db, SortBy::ImagePositionPatient).unwrap());
    assert_eq!(
        by_position,
        vec![PathBuf::from("/data/c.dcm"), PathBuf::from("/data/d.dcm"), PathBuf::from("/data/e.dcm")]
    );
    let first = series(&db, "1_T1w");
    let by_position = names(first.sorted_images(&db, SortBy::ImagePositionPatient).unwrap());
    assert_eq!(by_position, vec![PathBuf::from("/data/b.dcm"), PathBuf::from("/data/a.dcm")]);
    let by_instance = names(first.sorted_images(&db, SortBy::InstanceNumber).unwrap());
    assert_eq!(by_instance, vec![PathBuf::from("/data/a.dcm"), PathBuf::from("/data/b.dcm")]);
}

#[test]
fn new_series_is_unbound_until_written() {
    let mut db = fixture();
    let source = series(&db, "1_T1w");
    let mut derived = source.new_sibling(&db, "_proc").unwrap();
    assert_eq!(derived.id(), "1_T1w_proc");
    assert_eq!(derived.state(&db), SeriesState::Unbound);
    assert_eq!(derived.reference_paths().len(), 2);

    let arrays = vec![Array2::from_elem((4, 4), 7.0_f32), Array2::from_elem((4, 4), 9.0_f32)];
    let report = derived.write(&mut db, &arrays, &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(derived.state(&db), SeriesState::Bound);
    let images = derived.images(&db);
    assert_eq!(images.len(), 2);
    assert_eq!(images[1].read_pixels(&db).unwrap(), arrays[1]);
    assert!(db.verify().is_empty());
}

#[test]
fn image_lifecycle() {
    let mut db = fixture();
    let image = db.image(Path::new("/data/a.dcm")).unwrap();

    let mut sibling = image.new_sibling("_edit").unwrap();
    assert!(sibling.path().is_none());
    assert!(matches!(sibling.read_pixels(&db), Err(IndexError::Unbound)));
    sibling.write(&mut db, &Array2::from_elem((4, 4), 1.0)).unwrap();
    assert_eq!(sibling.path(), Some(Path::new("/data/a_edit.dcm")));
    assert_eq!(count(&db, &image.parent().path()), 3);

    let other = series(&db, "2_T1w");
    let mut copy = image.copy(&mut db, "_c", Some(&other)).unwrap();
    assert_eq!(copy.parent().id(), "2_T1w");
    assert_eq!(count(&db, &other.path()), 4);

    copy.delete(&mut db).unwrap();
    assert!(copy.is_deleted());
    assert_eq!(count(&db, &other.path()), 3);
    assert!(matches!(copy.delete(&mut db), Err(IndexError::Deleted)));
}

#[test]
fn image_merge_builds_a_new_series() {
    let mut db = fixture();
    let images: Vec<_> = ["/data/a.dcm", "/data/c.dcm"]
        .iter()
        .filter_map(|path| db.image(Path::new(path)))
        .collect();

    let (merged, report) = dicom_index::Image::merge(&mut db, &images, "7_Picked", &mut NoProgress).unwrap();

    assert!(report.is_complete());
    assert_eq!(merged.id(), "7_Picked");
    assert_eq!(count(&db, &merged.path()), 2);
    let tags = db.store().read_tags(&merged.image_paths(&db)[0]).unwrap();
    assert_eq!(tags.int(Tag::SeriesNumber), Some(7));
}

#[test]
fn masks_map_within_a_slice_and_drop_across() {
    let db = fixture();
    let a = db.image(Path::new("/data/a.dcm")).unwrap();
    let d = db.image(Path::new("/data/d.dcm")).unwrap();
    let c = db.image(Path::new("/data/c.dcm")).unwrap();
    let mut mask = Array2::from_elem((4, 4), false);
    mask[(1, 2)] = true;

    // a and d sit at z = 1, c at z = 0.
    assert_eq!(a.map_mask_to(&db, mask.view(), &d).unwrap(), vec![(1, 2)]);
    assert!(a.map_mask_to(&db, mask.view(), &c).unwrap().is_empty());

    let mapped = series(&db, "2_T1w").map_mask_onto(&db, mask.view(), &a, &mut NoProgress).unwrap();
    let hits: Vec<_> = mapped
        .iter()
        .filter(|(_, result)| result.as_ref().is_ok_and(|points| !points.is_empty()))
        .map(|(path, _)| path.clone())
        .collect();
    assert_eq!(hits, vec![PathBuf::from("/data/d.dcm")]);
}

#[test]
fn missing_geometry_is_distinct_from_an_empty_mapping() {
    let db = fixture();
    db.store().insert("/data/flat.dcm", TagSet::new().with(Tag::PatientID, "P1"));
    let a = db.image(Path::new("/data/a.dcm")).unwrap();
    let mask = Array2::from_elem((4, 4), true);

    let source = db.store().read_tags(a.path().unwrap()).unwrap();
    let target = db.store().read_tags(Path::new("/data/flat.dcm")).unwrap();
    let result = dicom_index::AffineMapper::map_mask_between(mask.view(), &source, &target);
    assert!(matches!(result, Err(IndexError::GeometryMissing(Tag::ImageOrientationPatient))));
}
