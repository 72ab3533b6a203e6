#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod cache;
mod config;
mod core;
pub mod engine;
mod error;
pub mod html;
#[cfg(feature = "logging")]
pub mod logging;
pub mod package;
pub mod paths;
pub mod transform;

pub use crate::blueprint::{Blueprint, Pipeline};
pub use crate::cache::{CacheEntry, CacheStore};
pub use crate::config::Config;
pub use crate::core::{BuildName, Environment, Hash32};
pub use crate::engine::diff::{ChangeSet, Instance};
pub use crate::engine::instanced::{
    ChangeSummary, FanOut, InstanceSource, InstancedOutput, InstancedStage, Lifecycle,
};
pub use crate::engine::runner::{BuildReport, StageStatus};
pub use crate::engine::write::{FileContents, WriteFileStage, WrittenFiles, write_files};
pub use crate::engine::{Dependencies, FnStage, Handle, Inputs, Stage, StageContext};
pub use crate::error::*;
pub use crate::package::{default_dispatcher, package_files};
pub use crate::paths::{Coordinate, DefaultPaths, PathNaming};
pub use crate::transform::dispatch::{DispatchOutput, Dispatcher};
pub use crate::transform::{
    Artifact, ArtifactDescriptor, AudioFormat, FormatOptions, Registry, TransformRequest,
    Transformer,
};
