use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("file name is empty")]
    Empty,
    #[error("file name contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Tracked names become directory names; they must be a single normal component.
pub fn validate_file_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Ok(()),
        _ => Err(PathError::UnsupportedComponent(name.to_string())),
    }
}

/// On-disk layout below the data root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.root.join("originals")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.root.join("latest")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.staging_dir().join("trash")
    }

    pub fn original_dir(&self, name: &str, version_id: i64) -> PathBuf {
        self.originals_dir()
            .join(name)
            .join(version_id.to_string())
    }

    pub fn version_dir(&self, name: &str, version_id: i64) -> PathBuf {
        self.versions_dir().join(name).join(version_id.to_string())
    }

    pub fn partial_path(&self, name: &str) -> PathBuf {
        self.staging_dir().join(format!("{name}.partial"))
    }

    pub fn partial_meta_path(&self, name: &str) -> PathBuf {
        self.staging_dir().join(format!("{name}.partial.json"))
    }

    pub fn unpack_dir(&self, name: &str) -> PathBuf {
        self.staging_dir().join(format!("{name}.unpacked"))
    }

    pub fn latest_link(&self, artifact_name: &str) -> PathBuf {
        self.latest_dir().join(artifact_name)
    }

    /// Relative target of the `latest` symlink, so the tree can be moved as a whole.
    pub fn latest_target(&self, name: &str, version_id: i64, artifact_name: &str) -> PathBuf {
        Path::new("..")
            .join("versions")
            .join(name)
            .join(version_id.to_string())
            .join(artifact_name)
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("state.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".wikisync.lock")
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.originals_dir(),
            self.versions_dir(),
            self.latest_dir(),
            self.staging_dir(),
            self.trash_dir(),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_files_under_data_root() {
        let layout = Layout::new("/data");
        assert_eq!(
            layout.version_dir("page.sql.gz", 42),
            PathBuf::from("/data/versions/page.sql.gz/42")
        );
        assert_eq!(
            layout.partial_path("page.sql.gz"),
            PathBuf::from("/data/staging/page.sql.gz.partial")
        );
        assert_eq!(
            layout.latest_target("page.sql.gz", 42, "page.sql"),
            PathBuf::from("../versions/page.sql.gz/42/page.sql")
        );
    }

    #[test]
    fn rejects_names_that_escape_the_layout() {
        assert!(validate_file_name("pages-articles.xml.bz2").is_ok());
        assert!(matches!(validate_file_name(""), Err(PathError::Empty)));
        assert!(matches!(
            validate_file_name("../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            validate_file_name("a/b"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(validate_file_name(".").is_err());
    }
}
