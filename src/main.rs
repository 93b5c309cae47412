use std::env;
use std::path::PathBuf;

use dicom_index::{Database, DicomFileStore, IndexConfig, SortBy};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let folder = env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("dicom"));
    let db = Database::open(&folder, DicomFileStore, IndexConfig::default())
        .expect("should have opened or scanned the folder");

    for subject in db.subjects() {
        for study in subject.studies(&db) {
            for series in study.series(&db) {
                match series.sorted_images(&db, SortBy::default()) {
                    Ok(images) => info!(
                        subject = subject.id(),
                        study = study.id(),
                        series = series.id(),
                        images = images.len(),
                        "series"
                    ),
                    Err(error) => warn!(series = series.id(), %error, "could not sort series"),
                }
            }
        }
    }

    for error in db.verify() {
        warn!(%error, "index out of date");
    }
    db.save().expect("should have saved the index");
}
