//! Typed registry of the DICOM attributes the index understands.
//!
//! Values are kept in their DICOM text form (multi-valued attributes joined
//! with `\`), which is what dicom-rs hands back from `to_str()`. The
//! [`Dataset`] trait layers typed getters on top and reports absent or
//! unparsable values as `None`.

use std::collections::BTreeMap;

use dicom::core::{Tag as DicomTag, VR};
use dicom_dictionary_std::tags;

use crate::enums::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    PatientID,
    PatientName,
    StudyDate,
    StudyTime,
    StudyDescription,
    StudyInstanceUID,
    SeriesNumber,
    SeriesDescription,
    SequenceName,
    ProtocolName,
    SeriesInstanceUID,
    SOPInstanceUID,
    InstanceNumber,
    AcquisitionDate,
    AcquisitionTime,
    Modality,
    Rows,
    Columns,
    NumberOfFrames,
    ImageOrientationPatient,
    ImagePositionPatient,
    PixelSpacing,
    SliceThickness,
    SpacingBetweenSlices,
    SliceLocation,
    TablePosition,
}

impl Tag {
    pub const ALL: [Tag; 26] = [
        Tag::PatientID,
        Tag::PatientName,
        Tag::StudyDate,
        Tag::StudyTime,
        Tag::StudyDescription,
        Tag::StudyInstanceUID,
        Tag::SeriesNumber,
        Tag::SeriesDescription,
        Tag::SequenceName,
        Tag::ProtocolName,
        Tag::SeriesInstanceUID,
        Tag::SOPInstanceUID,
        Tag::InstanceNumber,
        Tag::AcquisitionDate,
        Tag::AcquisitionTime,
        Tag::Modality,
        Tag::Rows,
        Tag::Columns,
        Tag::NumberOfFrames,
        Tag::ImageOrientationPatient,
        Tag::ImagePositionPatient,
        Tag::PixelSpacing,
        Tag::SliceThickness,
        Tag::SpacingBetweenSlices,
        Tag::SliceLocation,
        Tag::TablePosition,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Tag::PatientID => "PatientID",
            Tag::PatientName => "PatientName",
            Tag::StudyDate => "StudyDate",
            Tag::StudyTime => "StudyTime",
            Tag::StudyDescription => "StudyDescription",
            Tag::StudyInstanceUID => "StudyInstanceUID",
            Tag::SeriesNumber => "SeriesNumber",
            Tag::SeriesDescription => "SeriesDescription",
            Tag::SequenceName => "SequenceName",
            Tag::ProtocolName => "ProtocolName",
            Tag::SeriesInstanceUID => "SeriesInstanceUID",
            Tag::SOPInstanceUID => "SOPInstanceUID",
            Tag::InstanceNumber => "InstanceNumber",
            Tag::AcquisitionDate => "AcquisitionDate",
            Tag::AcquisitionTime => "AcquisitionTime",
            Tag::Modality => "Modality",
            Tag::Rows => "Rows",
            Tag::Columns => "Columns",
            Tag::NumberOfFrames => "NumberOfFrames",
            Tag::ImageOrientationPatient => "ImageOrientationPatient",
            Tag::ImagePositionPatient => "ImagePositionPatient",
            Tag::PixelSpacing => "PixelSpacing",
            Tag::SliceThickness => "SliceThickness",
            Tag::SpacingBetweenSlices => "SpacingBetweenSlices",
            Tag::SliceLocation => "SliceLocation",
            Tag::TablePosition => "TablePosition",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| tag.keyword() == keyword)
    }

    pub fn dicom_tag(self) -> DicomTag {
        match self {
            Tag::PatientID => tags::PATIENT_ID,
            Tag::PatientName => tags::PATIENT_NAME,
            Tag::StudyDate => tags::STUDY_DATE,
            Tag::StudyTime => tags::STUDY_TIME,
            Tag::StudyDescription => tags::STUDY_DESCRIPTION,
            Tag::StudyInstanceUID => tags::STUDY_INSTANCE_UID,
            Tag::SeriesNumber => tags::SERIES_NUMBER,
            Tag::SeriesDescription => tags::SERIES_DESCRIPTION,
            Tag::SequenceName => tags::SEQUENCE_NAME,
            Tag::ProtocolName => tags::PROTOCOL_NAME,
            Tag::SeriesInstanceUID => tags::SERIES_INSTANCE_UID,
            Tag::SOPInstanceUID => tags::SOP_INSTANCE_UID,
            Tag::InstanceNumber => tags::INSTANCE_NUMBER,
            Tag::AcquisitionDate => tags::ACQUISITION_DATE,
            Tag::AcquisitionTime => tags::ACQUISITION_TIME,
            Tag::Modality => tags::MODALITY,
            Tag::Rows => tags::ROWS,
            Tag::Columns => tags::COLUMNS,
            Tag::NumberOfFrames => tags::NUMBER_OF_FRAMES,
            Tag::ImageOrientationPatient => tags::IMAGE_ORIENTATION_PATIENT,
            Tag::ImagePositionPatient => tags::IMAGE_POSITION_PATIENT,
            Tag::PixelSpacing => tags::PIXEL_SPACING,
            Tag::SliceThickness => tags::SLICE_THICKNESS,
            Tag::SpacingBetweenSlices => tags::SPACING_BETWEEN_SLICES,
            Tag::SliceLocation => tags::SLICE_LOCATION,
            Tag::TablePosition => tags::TABLE_POSITION,
        }
    }

    pub fn vr(self) -> VR {
        match self {
            Tag::PatientID | Tag::StudyDescription | Tag::SeriesDescription | Tag::ProtocolName => {
                VR::LO
            }
            Tag::PatientName => VR::PN,
            Tag::StudyDate | Tag::AcquisitionDate => VR::DA,
            Tag::StudyTime | Tag::AcquisitionTime => VR::TM,
            Tag::StudyInstanceUID | Tag::SeriesInstanceUID | Tag::SOPInstanceUID => VR::UI,
            Tag::SeriesNumber | Tag::InstanceNumber | Tag::NumberOfFrames => VR::IS,
            Tag::SequenceName => VR::SH,
            Tag::Modality => VR::CS,
            Tag::Rows | Tag::Columns => VR::US,
            Tag::ImageOrientationPatient
            | Tag::ImagePositionPatient
            | Tag::PixelSpacing
            | Tag::SliceThickness
            | Tag::SpacingBetweenSlices
            | Tag::SliceLocation
            | Tag::TablePosition => VR::DS,
        }
    }

    /// The tree level whose composite ID or UID is derived from this tag.
    ///
    /// SequenceName and ProtocolName are included because they take part in
    /// the series description fallback chain.
    pub fn defines_id_of(self) -> Option<Level> {
        match self {
            Tag::PatientID => Some(Level::Subject),
            Tag::StudyDate | Tag::StudyTime | Tag::StudyDescription | Tag::StudyInstanceUID => {
                Some(Level::Study)
            }
            Tag::SeriesNumber
            | Tag::SeriesDescription
            | Tag::SequenceName
            | Tag::ProtocolName
            | Tag::SeriesInstanceUID => Some(Level::Series),
            _ => None,
        }
    }

    pub fn is_id_defining(self) -> bool {
        self.defines_id_of().is_some()
    }
}

/// Read access to tag values, with typed getters over the raw text.
pub trait Dataset {
    fn value(&self, tag: Tag) -> Option<&str>;

    /// Trimmed text value, `None` when absent or blank.
    fn text(&self, tag: Tag) -> Option<&str> {
        self.value(tag)
            .map(|value| value.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
            .filter(|value| !value.is_empty())
    }

    fn float(&self, tag: Tag) -> Option<f64> {
        self.floats(tag)?.first().copied()
    }

    fn floats(&self, tag: Tag) -> Option<Vec<f64>> {
        self.text(tag)?
            .split('\\')
            .map(|part| part.trim().parse::<f64>().ok())
            .collect()
    }

    fn int(&self, tag: Tag) -> Option<i64> {
        let text = self.text(tag)?;
        text.parse::<i64>()
            .ok()
            .or_else(|| text.parse::<f64>().ok().map(|value| value as i64))
    }
}

/// An owned set of tag values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<Tag, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: Tag, value: impl Into<String>) -> Self {
        self.insert(tag, value);
        self
    }

    pub fn insert(&mut self, tag: Tag, value: impl Into<String>) -> Option<String> {
        self.0.insert(tag, value.into())
    }

    pub fn remove(&mut self, tag: Tag) -> Option<String> {
        self.0.remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.0.contains_key(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &str)> {
        self.0.iter().map(|(tag, value)| (*tag, value.as_str()))
    }

    /// Overwrite values in `self` with every value present in `overrides`.
    pub fn apply(&mut self, overrides: &TagSet) {
        for (tag, value) in overrides.iter() {
            self.insert(tag, value);
        }
    }
}

impl Dataset for TagSet {
    fn value(&self, tag: Tag) -> Option<&str> {
        self.0.get(&tag).map(String::as_str)
    }
}

impl FromIterator<(Tag, String)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (Tag, String)>>(iter: I) -> Self {
        TagSet(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(Tag, &'a str)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (Tag, &'a str)>>(iter: I) -> Self {
        TagSet(
            iter.into_iter()
                .map(|(tag, value)| (tag, value.to_string()))
                .collect(),
        )
    }
}
