//! Async I/O support for signature databases and signature files
//!
//! File reads are async; XML decoding, signature file decoding and
//! identification run on the blocking pool so they never stall the runtime.

#![cfg(feature = "async")]

use std::path::{Path, PathBuf};

use tokio::{fs, task};

use crate::config::Config;
use crate::engine::{Engine, Identified};
use crate::error::{FormidError, FormidResult};
use crate::format::FormatDatabase;
use crate::loader::XmlFormats;
use crate::registry::Registry;
use crate::source::Buffer;

fn join_error(err: task::JoinError) -> FormidError {
    FormidError::custom(format!("Task join error: {}", err))
}

/// Async version of XML loading from file
pub async fn load_database_from_file_async<P: AsRef<Path>>(path: P) -> FormidResult<FormatDatabase> {
    let xml_content = fs::read_to_string(path.as_ref()).await?;
    load_database_from_xml_async(xml_content).await
}

/// Async version of XML loading from a string
pub async fn load_database_from_xml_async(xml_content: String) -> FormidResult<FormatDatabase> {
    task::spawn_blocking(move || {
        let xml_formats: XmlFormats = quick_xml::de::from_str(&xml_content)?;
        xml_formats.into_database()
    })
    .await
    .map_err(join_error)?
}

/// Load several databases concurrently, keeping the order of `paths`.
pub async fn load_multiple_databases_async<P: AsRef<Path>>(
    paths: &[P],
) -> FormidResult<Vec<FormatDatabase>> {
    let handles: Vec<_> = paths
        .iter()
        .map(|path| {
            let path: PathBuf = path.as_ref().to_path_buf();
            tokio::spawn(async move { load_database_from_file_async(path).await })
        })
        .collect();

    let mut databases = Vec::with_capacity(handles.len());
    for handle in handles {
        databases.push(handle.await.map_err(join_error)??);
    }
    Ok(databases)
}

/// Load a saved signature file into an engine.
pub async fn load_engine_from_file_async<P: AsRef<Path>>(
    path: P,
    registry: Registry,
    config: Config,
) -> FormidResult<Engine> {
    let bytes = fs::read(path.as_ref()).await?;
    task::spawn_blocking(move || Engine::load(&bytes, &registry, config))
        .await
        .map_err(join_error)?
}

/// Identify a file on disk without blocking the runtime.
pub async fn identify_file_async<P: AsRef<Path>>(
    engine: &Engine,
    path: P,
) -> FormidResult<Identified> {
    let engine = engine.clone();
    let path = path.as_ref().to_path_buf();
    task::spawn_blocking(move || {
        let source = Buffer::open(&path)?;
        let name = path.to_string_lossy();
        Ok(engine.identify(&name, "", &source))
    })
    .await
    .map_err(join_error)?
}
