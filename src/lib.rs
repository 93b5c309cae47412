//! # DICOM-index library
//!
//! This crate indexes a folder of DICOM files into a navigable
//! Subject → Study → Series → Image tree and keeps that tree consistent with
//! the files while they are copied, merged, deleted and re-tagged.
//!
//! The index is persisted next to the folder as `<folder>.xml`. When that
//! document is missing or unreadable the folder is scanned again, reading
//! headers in parallel using rayon. Nodes are keyed by human-readable
//! composite IDs:
//!  - Subject: PatientID
//!  - Study: `StudyDate_StudyTime_StudyDescription`
//!  - Series: `SeriesNumber_SeriesDescription` (falling back to
//!    SequenceName, then ProtocolName)
//!
//! All mutation goes through a single owning [`Database`]. The entity
//! handles ([`Subject`], [`Study`], [`Series`], [`Image`]) only hold IDs and
//! are resolved against the database on every call, so a handle never keeps
//! a structural change elsewhere from showing. Batch operations report per
//! file outcomes in a [`BatchReport`] and can be cancelled between files.
//!
//! The second part of the crate maps a region-of-interest mask drawn on one
//! image onto the pixel grid of another using both images' patient-space
//! geometry, see [`AffineMapper`]. Points that land outside the target
//! slice are dropped.
//!
//! # Examples
//!
//! ## Merging two series
//!
//! Open (or build) the index of the dicom/ directory, merge the first two
//! series of the first study into a new series and save the index.
//!
//! ```no_run
//! # use dicom_index::{Database, DicomFileStore, IndexConfig, NoProgress, Series};
//! let mut db = Database::open("dicom", DicomFileStore, IndexConfig::default())
//!     .expect("should have opened the folder");
//! let study = db.subjects()[0].studies(&db)[0].clone();
//! let series = study.series(&db);
//! let (merged, report) = Series::merge(&mut db, &series[..2], "99_Merged", &mut NoProgress)
//!     .expect("should have planned the merge");
//! assert!(report.is_complete());
//! println!("merged into {}", merged.id());
//! db.save().expect("should have saved the index");
//! ```
//!
//! ## Mapping a mask between two images
//!
//! ```no_run
//! # use dicom_index::{Database, DicomFileStore, IndexConfig, mask_from_coordinates};
//! # use ndarray::Array2;
//! # use std::path::Path;
//! let db = Database::open("dicom", DicomFileStore, IndexConfig::default()).unwrap();
//! let source = db.image(Path::new("dicom/a.dcm")).unwrap();
//! let target = db.image(Path::new("dicom/b.dcm")).unwrap();
//! let mut mask = Array2::from_elem((256, 256), false);
//! mask[(10, 20)] = true;
//! let points = source.map_mask_to(&db, mask.view(), &target).unwrap();
//! let target_mask = mask_from_coordinates(&points, (256, 256));
//! ```

pub mod affine;
pub mod batch;
pub mod config;
pub mod database;
pub mod enums;
pub mod error;
pub mod id_generator;
pub mod image;
pub mod index_loader;
pub mod metadata_index;
pub mod series;
pub mod store;
pub mod study;
pub mod subject;
pub mod tag;
mod xml;

pub use affine::{AffineMapper, Geometry, mask_from_coordinates};
pub use batch::{BatchReport, CancelFlag, NoProgress, ProgressSink, TagValues};
pub use config::IndexConfig;
pub use database::Database;
pub use enums::{Level, SortBy};
pub use error::{IndexError, Result};
pub use id_generator::IdGenerator;
pub use image::Image;
pub use index_loader::IndexLoader;
pub use metadata_index::{IdPath, ImageEntry, ImageRecord, MetadataIndex, Node, NodeId};
pub use series::{MappedMasks, Series, SeriesState};
pub use store::{DicomFileStore, FileStore, MemoryFileStore};
pub use study::Study;
pub use subject::Subject;
pub use tag::{Dataset, Tag, TagSet};
