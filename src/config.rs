use std::path::Path;

pub(crate) const DEFAULT_COLLISION_SUFFIX: &str = "_1";

/// Options controlling how a folder is scanned and how names are resolved.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Lower-case file extensions treated as DICOM files.
    pub extensions: Vec<String>,
    /// Also consider files without any extension (common for scanner exports).
    pub include_extensionless: bool,
    /// Suffix appended when a target name is taken by merges, or by a
    /// study or series with a different UID while scanning.
    pub collision_suffix: String,
    /// Read headers in parallel with rayon while scanning.
    pub parallel_scan: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["dcm".to_string()],
            include_extensionless: true,
            collision_suffix: DEFAULT_COLLISION_SUFFIX.to_string(),
            parallel_scan: true,
        }
    }
}

impl IndexConfig {
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_extensionless(mut self, include: bool) -> Self {
        self.include_extensionless = include;
        self
    }

    pub fn with_collision_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.collision_suffix = suffix.into();
        self
    }

    pub fn with_parallel_scan(mut self, parallel: bool) -> Self {
        self.parallel_scan = parallel;
        self
    }

    pub(crate) fn accepts(&self, path: &Path) -> bool {
        match path.extension().and_then(|s| s.to_str()) {
            Some(ext) => self
                .extensions
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted)),
            None => self.include_extensionless,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        let config = IndexConfig::default();
        assert!(config.accepts(Path::new("/data/a.dcm")));
        assert!(config.accepts(Path::new("/data/A.DCM")));
        assert!(config.accepts(Path::new("/data/IM0001")));
        assert!(!config.accepts(Path::new("/data/notes.txt")));

        let strict = config.with_extensionless(false).with_extensions(["IMA"]);
        assert!(strict.accepts(Path::new("/data/x.ima")));
        assert!(!strict.accepts(Path::new("/data/IM0001")));
        assert!(!strict.accepts(Path::new("/data/a.dcm")));
    }
}
