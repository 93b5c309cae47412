//! Composite IDs, collision-free naming and UID minting.
//!
//! Study and series IDs have the form `<ordinal>_<description>`:
//!  - study: `<StudyDate>_<StudyTime>_<StudyDescription>`
//!  - series: `<SeriesNumber>_<description>`, where the description is the
//!    first present of SeriesDescription, SequenceName and ProtocolName.

use rand::Rng;
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::metadata_index::{IdPath, MetadataIndex};
use crate::tag::{Dataset, Tag};

pub const UNKNOWN: &str = "Unknown";

/// Root used when no related UID is available (UUID-derived UIDs, PS3.5 B.2).
const UUID_ROOT: &str = "2.25";
const MAX_UID_LENGTH: usize = 64;

pub struct IdGenerator;

impl IdGenerator {
    pub fn subject_id(tags: &impl Dataset) -> String {
        tags.text(Tag::PatientID).unwrap_or(UNKNOWN).to_string()
    }

    /// `StudyDate_StudyTime`, with fractional seconds dropped from the time.
    pub fn study_ordinal(tags: &impl Dataset) -> String {
        let date = tags.text(Tag::StudyDate).unwrap_or_default();
        let time = tags.text(Tag::StudyTime).unwrap_or_default();
        let time = time.split('.').next().unwrap_or_default();
        format!("{date}_{time}")
    }

    pub fn study_description(tags: &impl Dataset) -> String {
        tags.text(Tag::StudyDescription).unwrap_or(UNKNOWN).to_string()
    }

    pub fn study_id(tags: &impl Dataset) -> String {
        Self::compose(&Self::study_ordinal(tags), &Self::study_description(tags))
    }

    pub fn series_ordinal(tags: &impl Dataset) -> String {
        tags.int(Tag::SeriesNumber)
            .map(|number| number.to_string())
            .unwrap_or_else(|| "0".to_string())
    }

    pub fn series_description(tags: &impl Dataset) -> String {
        [Tag::SeriesDescription, Tag::SequenceName, Tag::ProtocolName]
            .into_iter()
            .find_map(|tag| tags.text(tag))
            .unwrap_or(UNKNOWN)
            .to_string()
    }

    pub fn series_id(tags: &impl Dataset) -> String {
        Self::compose(&Self::series_ordinal(tags), &Self::series_description(tags))
    }

    pub fn compose(ordinal: &str, description: &str) -> String {
        format!("{ordinal}_{description}")
    }

    /// Split a series name such as `99_Merged` into SeriesNumber and
    /// description. Names without a numeric prefix are all description.
    pub fn split_series_name(name: &str) -> (Option<i64>, &str) {
        match name.split_once('_') {
            Some((number, description)) => match number.parse::<i64>() {
                Ok(number) => (Some(number), description),
                Err(_) => (None, name),
            },
            None => (None, name),
        }
    }

    /// Append `suffix` to `description` until `taken` no longer reports a
    /// collision for the composed ID. Every retry grows the name, so with N
    /// taken names this returns after at most N appends.
    ///
    /// # Errors
    ///
    /// `EmptySuffix` when a collision exists and `suffix` is empty, since the
    /// name could never change.
    pub fn resolve_description(
        ordinal: Option<&str>,
        description: &str,
        suffix: &str,
        mut taken: impl FnMut(&str) -> bool,
    ) -> Result<String> {
        let compose = |description: &str| match ordinal {
            Some(ordinal) => Self::compose(ordinal, description),
            None => description.to_string(),
        };
        let mut description = description.to_string();
        while taken(&compose(&description)) {
            if suffix.is_empty() {
                return Err(IndexError::EmptySuffix(compose(&description)));
            }
            description.push_str(suffix);
        }
        Ok(description)
    }

    /// New series description under `study` for the candidate tags.
    ///
    /// A series ID collides when a series with that ID already holds images
    /// under the same study. `reserved` lists IDs already promised to other
    /// series in the same batch.
    pub fn new_series_description(
        index: &MetadataIndex,
        study: &IdPath,
        candidate: &impl Dataset,
        suffix: &str,
        reserved: &[String],
    ) -> Result<String> {
        let ordinal = Self::series_ordinal(candidate);
        Self::resolve_description(
            Some(&ordinal),
            &Self::series_description(candidate),
            suffix,
            |id| {
                reserved.iter().any(|r| r == id)
                    || study
                        .child(id)
                        .is_some_and(|path| !index.image_paths(&path).is_empty())
            },
        )
    }

    /// Same as [`Self::new_series_description`] but returns the full series ID.
    pub fn new_series_name(
        index: &MetadataIndex,
        study: &IdPath,
        candidate: &impl Dataset,
        suffix: &str,
    ) -> Result<String> {
        let description = Self::new_series_description(index, study, candidate, suffix, &[])?;
        Ok(Self::compose(&Self::series_ordinal(candidate), &description))
    }

    pub fn new_study_description(
        index: &MetadataIndex,
        subject: &IdPath,
        candidate: &impl Dataset,
        suffix: &str,
        reserved: &[String],
    ) -> Result<String> {
        let ordinal = Self::study_ordinal(candidate);
        Self::resolve_description(
            Some(&ordinal),
            &Self::study_description(candidate),
            suffix,
            |id| {
                reserved.iter().any(|r| r == id)
                    || subject
                        .child(id)
                        .is_some_and(|path| !index.image_paths(&path).is_empty())
            },
        )
    }

    pub fn new_subject_name(index: &MetadataIndex, candidate: &str, suffix: &str) -> Result<String> {
        Self::resolve_description(None, candidate, suffix, |id| {
            !index.image_paths(&IdPath::subject(id)).is_empty()
        })
    }

    /// Mint a UID related to `related`.
    ///
    /// The first five components of `related` are kept as a prefix, followed
    /// by a random integer and a freshly generated number. Unique in
    /// practice, not by construction.
    pub fn generate_uid(related: &str) -> String {
        let prefix: Vec<&str> = related
            .split('.')
            .filter(|component| !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit()))
            .take(5)
            .collect();
        let random: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        let fresh = (Uuid::new_v4().as_u128() as u64).max(1);

        let uid = if prefix.is_empty() {
            format!("{UUID_ROOT}.{random}.{fresh}")
        } else {
            format!("{}.{random}.{fresh}", prefix.join("."))
        };
        if uid.len() <= MAX_UID_LENGTH {
            uid
        } else {
            Self::fresh_uid()
        }
    }

    /// A UID under the UUID root, independent of any existing UID.
    pub fn fresh_uid() -> String {
        format!("{UUID_ROOT}.{}", Uuid::new_v4().as_u128())
    }
}
