//! File access behind the index: tag reads and writes, copies, deletes and
//! pixel data.
//!
//! [`DicomFileStore`] works on real files through dicom-rs.
//! [`MemoryFileStore`] keeps everything in memory and can be told to fail on
//! chosen paths, which makes batch behaviour easy to exercise.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, PixelDecoder};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use parking_lot::RwLock;

use crate::error::{IndexError, Result};
use crate::tag::{Dataset, Tag, TagSet};

pub trait FileStore {
    fn exists(&self, path: &Path) -> bool;

    /// Read every registry tag present in the file.
    fn read_tags(&self, path: &Path) -> Result<TagSet>;

    fn read_tag(&self, path: &Path, tag: Tag) -> Result<Option<String>> {
        Ok(self.read_tags(path)?.text(tag).map(str::to_string))
    }

    fn write_tags(&self, path: &Path, values: &TagSet) -> Result<()>;

    fn write_tag(&self, path: &Path, tag: Tag, value: &str) -> Result<()> {
        self.write_tags(path, &TagSet::new().with(tag, value))
    }

    /// Copy `source` to `target`, applying `overrides` to the copy.
    fn copy(&self, source: &Path, target: &Path, overrides: &TagSet) -> Result<()>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// First frame of the image, with the modality rescale applied.
    fn read_pixel_array(&self, path: &Path) -> Result<Array2<f32>>;

    fn write_pixel_array(&self, path: &Path, pixels: &Array2<f32>) -> Result<()>;
}

/// dicom-rs backed store working on files in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomFileStore;

impl DicomFileStore {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> Result<FileDicomObject<InMemDicomObject>> {
        Ok(open_file(path)?)
    }

    fn put(
        object: &mut FileDicomObject<InMemDicomObject>,
        tag: Tag,
        value: &str,
    ) -> std::result::Result<(), String> {
        let primitive = match tag.vr() {
            VR::US => value
                .trim()
                .parse::<u16>()
                .map(PrimitiveValue::from)
                .map_err(|e| format!("{}: {e}", tag.keyword()))?,
            _ => PrimitiveValue::from(value.to_string()),
        };
        object.put(DataElement::new(tag.dicom_tag(), tag.vr(), primitive));
        Ok(())
    }

    fn put_u16(object: &mut FileDicomObject<InMemDicomObject>, tag: dicom::core::Tag, value: u16) {
        object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }

    fn put_text(object: &mut FileDicomObject<InMemDicomObject>, tag: dicom::core::Tag, vr: VR, value: String) {
        object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    fn tags_of(object: &FileDicomObject<InMemDicomObject>) -> TagSet {
        Tag::ALL
            .into_iter()
            .filter_map(|tag| {
                let value = object.element(tag.dicom_tag()).ok()?.to_str().ok()?;
                Some((tag, value.into_owned()))
            })
            .collect()
    }
}

impl FileStore for DicomFileStore {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_tags(&self, path: &Path) -> Result<TagSet> {
        Ok(Self::tags_of(&Self::open(path)?))
    }

    fn write_tags(&self, path: &Path, values: &TagSet) -> Result<()> {
        let mut object = Self::open(path)?;
        for (tag, value) in values.iter() {
            Self::put(&mut object, tag, value).map_err(|e| IndexError::store(path, e))?;
        }
        object.write_to_file(path)?;
        Ok(())
    }

    fn copy(&self, source: &Path, target: &Path, overrides: &TagSet) -> Result<()> {
        let mut object = Self::open(source)?;
        for (tag, value) in overrides.iter() {
            Self::put(&mut object, tag, value).map_err(|e| IndexError::store(source, e))?;
        }
        if let Some(uid) = overrides.text(Tag::SOPInstanceUID) {
            let meta = object.meta_mut();
            meta.media_storage_sop_instance_uid = uid.to_string();
            meta.update_information_group_length();
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        object.write_to_file(target)?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn read_pixel_array(&self, path: &Path) -> Result<Array2<f32>> {
        let object = Self::open(path)?;
        let pixel_data = object
            .decode_pixel_data()
            .map_err(|e| IndexError::PixelData(e.to_string()))?;
        let array = pixel_data
            .to_ndarray_with_options::<f32>(&ConvertOptions::new())
            .map_err(|e| IndexError::PixelData(e.to_string()))?;
        Ok(array.slice_move(s![0, .., .., 0]))
    }

    /// Stored as unsigned 16-bit with a RescaleSlope/Intercept mapping the
    /// value range onto 0..=65535.
    fn write_pixel_array(&self, path: &Path, pixels: &Array2<f32>) -> Result<()> {
        let (rows, columns) = pixels.dim();
        let rows = u16::try_from(rows).map_err(|_| IndexError::PixelData(format!("{rows} rows")))?;
        let columns =
            u16::try_from(columns).map_err(|_| IndexError::PixelData(format!("{columns} columns")))?;

        let min = pixels.iter().copied().fold(f32::INFINITY, f32::min);
        let max = pixels.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let (intercept, slope) = if min.is_finite() && max > min {
            (min, (max - min) / f32::from(u16::MAX))
        } else {
            (if min.is_finite() { min } else { 0.0 }, 1.0)
        };
        let bytes: Vec<u8> = pixels
            .iter()
            .flat_map(|&value| {
                let stored = ((value - intercept) / slope).round().clamp(0.0, f32::from(u16::MAX)) as u16;
                stored.to_le_bytes()
            })
            .collect();

        let mut object = Self::open(path)?;
        Self::put_u16(&mut object, tags::ROWS, rows);
        Self::put_u16(&mut object, tags::COLUMNS, columns);
        Self::put_u16(&mut object, tags::SAMPLES_PER_PIXEL, 1);
        Self::put_u16(&mut object, tags::BITS_ALLOCATED, 16);
        Self::put_u16(&mut object, tags::BITS_STORED, 16);
        Self::put_u16(&mut object, tags::HIGH_BIT, 15);
        Self::put_u16(&mut object, tags::PIXEL_REPRESENTATION, 0);
        Self::put_text(&mut object, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2".to_string());
        Self::put_text(&mut object, tags::RESCALE_INTERCEPT, VR::DS, intercept.to_string());
        Self::put_text(&mut object, tags::RESCALE_SLOPE, VR::DS, slope.to_string());
        object.remove_element(tags::NUMBER_OF_FRAMES);
        object.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(bytes)));
        object.write_to_file(path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryFile {
    tags: TagSet,
    pixels: Option<Array2<f32>>,
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<PathBuf, MemoryFile>>,
    failing: RwLock<HashSet<PathBuf>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, tags: TagSet) {
        self.files
            .write()
            .insert(path.into(), MemoryFile { tags, pixels: None });
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Make every operation that touches `path` fail with a store error.
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing.write().insert(path.into());
    }

    fn check(&self, path: &Path) -> Result<()> {
        if self.failing.read().contains(path) {
            return Err(IndexError::store(path, "injected failure"));
        }
        Ok(())
    }

    fn missing(path: &Path) -> IndexError {
        IndexError::store(path, "no such file")
    }
}

impl FileStore for MemoryFileStore {
    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn read_tags(&self, path: &Path) -> Result<TagSet> {
        self.check(path)?;
        self.files
            .read()
            .get(path)
            .map(|file| file.tags.clone())
            .ok_or_else(|| Self::missing(path))
    }

    fn write_tags(&self, path: &Path, values: &TagSet) -> Result<()> {
        self.check(path)?;
        let mut files = self.files.write();
        let file = files.get_mut(path).ok_or_else(|| Self::missing(path))?;
        file.tags.apply(values);
        Ok(())
    }

    fn copy(&self, source: &Path, target: &Path, overrides: &TagSet) -> Result<()> {
        self.check(source)?;
        self.check(target)?;
        let mut files = self.files.write();
        let mut file = files.get(source).cloned().ok_or_else(|| Self::missing(source))?;
        file.tags.apply(overrides);
        files.insert(target.to_path_buf(), file);
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.check(path)?;
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::missing(path))
    }

    fn read_pixel_array(&self, path: &Path) -> Result<Array2<f32>> {
        self.check(path)?;
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| Self::missing(path))?;
        if let Some(pixels) = &file.pixels {
            return Ok(pixels.clone());
        }
        let rows = file.tags.int(Tag::Rows).unwrap_or(0).max(0) as usize;
        let columns = file.tags.int(Tag::Columns).unwrap_or(0).max(0) as usize;
        Ok(Array2::zeros((rows, columns)))
    }

    fn write_pixel_array(&self, path: &Path, pixels: &Array2<f32>) -> Result<()> {
        self.check(path)?;
        let mut files = self.files.write();
        let file = files.get_mut(path).ok_or_else(|| Self::missing(path))?;
        let (rows, columns) = pixels.dim();
        file.tags.insert(Tag::Rows, rows.to_string());
        file.tags.insert(Tag::Columns, columns.to_string());
        file.pixels = Some(pixels.clone());
        Ok(())
    }
}
