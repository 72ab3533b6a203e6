//! Where things live on disk.
//!
//! Every directory a build touches is derived from a [`Coordinate`] through a
//! [`PathNaming`] implementation, so the layout can be swapped without
//! touching any stage.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::core::BuildName;

/// Identifies a single source file within a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub build: BuildName,
    pub game: String,
    pub package: String,
    pub file: String,
    pub extension: String,
}

impl Coordinate {
    pub fn new(
        build: BuildName,
        game: impl Into<String>,
        package: impl Into<String>,
        file: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            build,
            game: game.into(),
            package: package.into(),
            file: file.into(),
            extension: extension.into(),
        }
    }

    /// `file.extension`, the name of the source file.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.file, self.extension)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.build, self.game, self.package, self.file, self.extension
        )
    }
}

/// The naming service mapping coordinates to paths.
pub trait PathNaming: Send + Sync {
    /// Source file for a coordinate.
    fn source(&self, coord: &Coordinate) -> Utf8PathBuf;

    /// Directory holding everything derived from one source file.
    fn temp(&self, coord: &Coordinate) -> Utf8PathBuf;

    /// Serialized artifact descriptor for one source file.
    fn cache_file(&self, coord: &Coordinate) -> Utf8PathBuf {
        self.temp(coord).join("cache.json")
    }

    /// Source directory of a package.
    fn package_source(&self, game: &str, package: &str) -> Utf8PathBuf;

    /// Final output directory of a game.
    fn dist(&self, build: BuildName, game: &str) -> Utf8PathBuf;
}

/// The layout used unless something else is injected:
///
/// - source: `{source}/{game}/{package}/{file}.{ext}`
/// - temp: `{temp}/{build}/{game}/{package}/{file}.{ext}/`
/// - dist: `{dist}/{build}/{game}/`
#[derive(Debug, Clone)]
pub struct DefaultPaths {
    source_dir: Utf8PathBuf,
    temp_dir: Utf8PathBuf,
    dist_dir: Utf8PathBuf,
}

impl DefaultPaths {
    pub fn new(
        source_dir: impl AsRef<Utf8Path>,
        temp_dir: impl AsRef<Utf8Path>,
        dist_dir: impl AsRef<Utf8Path>,
    ) -> Self {
        Self {
            source_dir: source_dir.as_ref().to_owned(),
            temp_dir: temp_dir.as_ref().to_owned(),
            dist_dir: dist_dir.as_ref().to_owned(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.source_dir, &config.temp_dir, &config.dist_dir)
    }
}

impl PathNaming for DefaultPaths {
    fn source(&self, coord: &Coordinate) -> Utf8PathBuf {
        self.package_source(&coord.game, &coord.package)
            .join(coord.file_name())
    }

    fn temp(&self, coord: &Coordinate) -> Utf8PathBuf {
        self.temp_dir
            .join(coord.build.as_str())
            .join(&coord.game)
            .join(&coord.package)
            .join(coord.file_name())
    }

    fn package_source(&self, game: &str, package: &str) -> Utf8PathBuf {
        self.source_dir.join(game).join(package)
    }

    fn dist(&self, build: BuildName, game: &str) -> Utf8PathBuf {
        self.dist_dir.join(build.as_str()).join(game)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let paths = DefaultPaths::new("src", ".cache", "dist");
        let coord = Coordinate::new(BuildName::Watch, "pong", "sprites", "ball", "svg");

        assert_eq!(paths.source(&coord), "src/pong/sprites/ball.svg");
        assert_eq!(paths.temp(&coord), ".cache/watch/pong/sprites/ball.svg");
        assert_eq!(
            paths.cache_file(&coord),
            ".cache/watch/pong/sprites/ball.svg/cache.json"
        );
        assert_eq!(paths.dist(BuildName::OneOff, "pong"), "dist/oneOff/pong");
    }

    #[test]
    fn test_coordinates_partition_temp_dirs() {
        let paths = DefaultPaths::new("src", ".cache", "dist");
        let a = Coordinate::new(BuildName::OneOff, "pong", "sprites", "ball", "svg");
        let b = Coordinate::new(BuildName::OneOff, "pong", "sprites", "ball", "wav");

        assert_ne!(paths.temp(&a), paths.temp(&b));
    }
}
