//! Variant generator mode: apply a named variant from the meta file to the
//! template file, producing the working manifest.

use thiserror::Error;

use crate::manifest::Meta;
use crate::settings::Settings;
use crate::template::{self, TemplateError};

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("meta read error: {0}")]
    Read(#[source] std::io::Error),
    #[error("meta parse error: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("variant not defined")]
    UnknownVariant,
    #[error("template read error: {0}")]
    TemplateRead(#[source] std::io::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("config write error: {0}")]
    ConfigWrite(#[source] std::io::Error),
    #[error("meta encode error: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("meta write error: {0}")]
    Write(#[source] std::io::Error),
}

pub fn load(settings: &Settings) -> Result<Meta, MetaError> {
    let raw = std::fs::read_to_string(&settings.meta_path).map_err(MetaError::Read)?;
    serde_yaml::from_str(&raw).map_err(MetaError::Parse)
}

/// Print the defined variants and the active selection.
pub fn show(settings: &Settings) -> Result<(), MetaError> {
    let meta = load(settings)?;
    println!("Defined variants:");
    for name in meta.variants.keys() {
        println!("{name}");
    }
    println!("Active: {}", meta.active);
    Ok(())
}

/// Render the template file against `variant`'s value map, write the
/// result to the manifest path, and record the new active variant.
pub fn apply(settings: &Settings, variant: &str) -> Result<(), MetaError> {
    let mut meta = load(settings)?;
    let vars = meta
        .variants
        .get(variant)
        .cloned()
        .ok_or(MetaError::UnknownVariant)?;

    let body = std::fs::read_to_string(&settings.template_path).map_err(MetaError::TemplateRead)?;
    let rendered = template::render(&body, &vars)?;
    std::fs::write(&settings.manifest_path, rendered).map_err(MetaError::ConfigWrite)?;

    meta.active = variant.to_string();
    let encoded = serde_yaml::to_string(&meta).map_err(MetaError::Encode)?;
    std::fs::write(&settings.meta_path, encoded).map_err(MetaError::Write)?;
    Ok(())
}
