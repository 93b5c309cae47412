/// Depth of a node in the Subject/Study/Series/Image tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Subject,
    Study,
    Series,
    Image,
}

impl Level {
    /// Element name used for this level in the persisted document.
    pub fn element_name(self) -> &'static str {
        match self {
            Level::Subject => "subject",
            Level::Study => "study",
            Level::Series => "series",
            Level::Image => "image",
        }
    }
}

/// Ordering applied by [`crate::series::Series::sorted_images`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
