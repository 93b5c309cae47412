use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, open_file};
use dicom_dictionary_std::{tags, uids};
use dicom_index::{Database, DicomFileStore, FileStore, IndexConfig, IndexLoader, NoProgress, Series, Tag};
use ndarray::{Array2, array};

const STUDY_UID: &str = "1.2.826.0.1.3680043.10.7";

fn text(tag: dicom::core::Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

fn short(tag: dicom::core::Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

/// A 2×2 MR slice holding the values 1..=4.
fn write_image(path: &Path, series: u16, instance: u16, z: f64) {
    let sop = format!("{STUDY_UID}.{series}.{instance}");
    let pixels: Vec<u8> = [1u16, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
    let object = InMemDicomObject::from_element_iter([
        text(tags::SOP_CLASS_UID, VR::UI, uids::MR_IMAGE_STORAGE),
        text(tags::SOP_INSTANCE_UID, VR::UI, &sop),
        text(tags::PATIENT_ID, VR::LO, "P1"),
        text(tags::STUDY_DATE, VR::DA, "20240101"),
        text(tags::STUDY_TIME, VR::TM, "120000"),
        text(tags::STUDY_DESCRIPTION, VR::LO, "MR"),
        text(tags::STUDY_INSTANCE_UID, VR::UI, STUDY_UID),
        text(tags::SERIES_NUMBER, VR::IS, &series.to_string()),
        text(tags::SERIES_DESCRIPTION, VR::LO, "T1w"),
        text(tags::SERIES_INSTANCE_UID, VR::UI, &format!("{STUDY_UID}.{series}")),
        text(tags::INSTANCE_NUMBER, VR::IS, &instance.to_string()),
        text(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, "1\\0\\0\\0\\1\\0"),
        text(tags::PIXEL_SPACING, VR::DS, "1\\1"),
        text(tags::SLICE_THICKNESS, VR::DS, "1"),
        text(tags::IMAGE_POSITION_PATIENT, VR::DS, &format!("0\\0\\{z}")),
        short(tags::ROWS, 2),
        short(tags::COLUMNS, 2),
        short(tags::SAMPLES_PER_PIXEL, 1),
        short(tags::BITS_ALLOCATED, 16),
        short(tags::BITS_STORED, 16),
        short(tags::HIGH_BIT, 15),
        short(tags::PIXEL_REPRESENTATION, 0),
        text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)),
    ]);
    let file = object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

/// `<tmp>/dicom` with series 1 (`a`, `b`) and series 2 (`c`).
fn folder() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("dicom");
    std::fs::create_dir_all(&folder).unwrap();
    write_image(&folder.join("a.dcm"), 1, 1, 0.0);
    write_image(&folder.join("b.dcm"), 1, 2, 1.0);
    write_image(&folder.join("c.dcm"), 2, 1, 0.0);
    (dir, folder)
}

#[test]
fn scan_merge_save_and_reopen() {
    let (_dir, folder) = folder();
    let mut db = Database::open(&folder, DicomFileStore, IndexConfig::default()).unwrap();
    assert_eq!(db.index().image_count(), 3);
    assert!(db.verify().is_empty());

    let study = db.subject("P1").unwrap().studies(&db).remove(0);
    assert_eq!(study.id(), "20240101_120000_MR");
    let series = study.series(&db);
    let (merged, report) = Series::merge(&mut db, &series, "99_Merged", &mut NoProgress).unwrap();
    assert!(report.is_complete());
    assert_eq!(merged.image_paths(&db).len(), 3);
    assert!(db.verify().is_empty());

    for path in merged.image_paths(&db) {
        let object = open_file(&path).unwrap();
        let sop = object.element(tags::SOP_INSTANCE_UID).unwrap().to_str().unwrap().into_owned();
        let meta_sop = object.meta().media_storage_sop_instance_uid.trim_end_matches('\0').to_string();
        assert_eq!(sop.trim_end_matches('\0'), meta_sop);
    }

    db.save().unwrap();
    assert!(IndexLoader::index_location(&folder).is_file());

    let reopened = Database::open(&folder, DicomFileStore, IndexConfig::default()).unwrap();
    assert_eq!(reopened.index().image_count(), 6);
    assert_eq!(reopened.subject("P1").unwrap().studies(&reopened)[0].series(&reopened).len(), 3);
    assert!(reopened.verify().is_empty());
}

#[test]
fn pixels_round_trip_through_the_file() {
    let (_dir, folder) = folder();
    let db = Database::open(&folder, DicomFileStore, IndexConfig::default()).unwrap();
    let image = db.image(&folder.join("a.dcm")).unwrap();

    assert_eq!(image.read_pixels(&db).unwrap(), array![[1.0, 2.0], [3.0, 4.0]]);

    let written: Array2<f32> = array![[0.0, 10.0], [20.0, 30.0]];
    image.write_pixels(&db, &written).unwrap();
    let read = image.read_pixels(&db).unwrap();
    for (a, b) in read.iter().zip(written.iter()) {
        assert!((a - b).abs() < 0.01, "{a} != {b}");
    }
}

#[test]
fn retagging_rewrites_the_file_and_the_index() {
    let (_dir, folder) = folder();
    let mut db = Database::open(&folder, DicomFileStore, IndexConfig::default()).unwrap();
    let path = folder.join("c.dcm");
    let mut image = db.image(&path).unwrap();

    image.set_value(&mut db, Tag::SeriesDescription, "T2w").unwrap();

    assert_eq!(image.parent().id(), "2_T2w");
    assert_eq!(
        db.store().read_tag(&path, Tag::SeriesDescription).unwrap().as_deref(),
        Some("T2w")
    );
    assert!(db.verify().is_empty());
}

#[test]
fn mask_maps_between_real_files() {
    let (_dir, folder) = folder();
    let db = Database::open(&folder, DicomFileStore, IndexConfig::default()).unwrap();
    let a = db.image(&folder.join("a.dcm")).unwrap();
    let b = db.image(&folder.join("b.dcm")).unwrap();
    let c = db.image(&folder.join("c.dcm")).unwrap();
    let mut mask = Array2::from_elem((2, 2), false);
    mask[(0, 1)] = true;

    assert_eq!(a.map_mask_to(&db, mask.view(), &c).unwrap(), vec![(0, 1)]);
    assert!(a.map_mask_to(&db, mask.view(), &b).unwrap().is_empty());
}
