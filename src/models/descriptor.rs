//! Represents a network-function descriptor and the image references inside
//! its JSON document.
//!
//! The document is opaque except for the `vdu` array: each entry names its
//! image in `vm_image` and carries the image metadata in `vm_image_md5` and
//! `vm_image_format`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

pub const VDU: &str = "vdu";
pub const VM_IMAGE: &str = "vm_image";
pub const VM_IMAGE_MD5: &str = "vm_image_md5";
pub const VM_IMAGE_FORMAT: &str = "vm_image_format";
pub const DESCRIPTOR_ID: &str = "id";

#[derive(Debug, Error)]
#[error("cannot build file url for `{name}` from `{base}`")]
pub struct LocatorError {
    pub base: String,
    pub name: String,
}

/// A descriptor record together with its resolved file links.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Descriptor {
    pub id: i64,

    /// Raw descriptor document.
    pub document: Value,

    /// Image names found in the document, in document order.
    pub referenced_file_names: Vec<String>,

    /// Orchestrator-assigned identifier; unset until a create is acknowledged.
    pub external_id: Option<String>,

    /// Names of the artifacts linked to this descriptor.
    #[serde(default)]
    pub files: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Descriptor {
    /// Re-read the image names from the current document.
    pub fn refresh_file_names(&mut self) {
        self.referenced_file_names = image_file_names(&self.document);
    }

    /// Replace every image reference with an absolute locator URL.
    pub fn rewrite_images_to_locators(&mut self, base: &Url) -> Result<(), LocatorError> {
        for entry in vdu_entries_mut(&mut self.document) {
            let Some(name) = entry.get(VM_IMAGE).and_then(Value::as_str).and_then(file_name_of)
            else {
                continue;
            };
            let locator = locator_url(base, &name)?;
            entry.insert(VM_IMAGE.into(), Value::String(locator.to_string()));
        }
        Ok(())
    }

    /// Write the id into the document's top-level `id` field.
    pub fn inject_id(&mut self) {
        if let Value::Object(map) = &mut self.document {
            map.insert(DESCRIPTOR_ID.into(), Value::from(self.id));
        }
    }

    /// Set or clear the embedded metadata of every image entry named `name`.
    pub fn set_image_metadata(
        &mut self,
        name: &str,
        checksum: Option<&str>,
        image_type: Option<&str>,
    ) {
        for entry in vdu_entries_mut(&mut self.document) {
            let matches = entry
                .get(VM_IMAGE)
                .and_then(Value::as_str)
                .and_then(file_name_of)
                .is_some_and(|image| image == name);
            if !matches {
                continue;
            }
            set_or_remove(entry, VM_IMAGE_MD5, checksum);
            set_or_remove(entry, VM_IMAGE_FORMAT, image_type);
        }
    }
}

/// Image names referenced by a document, in order, without duplicates.
pub fn image_file_names(document: &Value) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let Some(vdus) = document.get(VDU).and_then(Value::as_array) else {
        return names;
    };
    for name in vdus
        .iter()
        .filter_map(|vdu| vdu.get(VM_IMAGE))
        .filter_map(Value::as_str)
        .filter_map(file_name_of)
    {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Absolute URL under which the store serves `name`: `<base>/files/<name>`.
pub fn locator_url(base: &Url, name: &str) -> Result<Url, LocatorError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| LocatorError {
            base: base.to_string(),
            name: name.to_string(),
        })?
        .pop_if_empty()
        .push("files")
        .push(name);
    Ok(url)
}

/// Last `/`-separated segment of an image reference, if non-empty.
fn file_name_of(reference: &str) -> Option<String> {
    let name = reference.trim().rsplit('/').next()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn vdu_entries_mut(document: &mut Value) -> impl Iterator<Item = &mut Map<String, Value>> {
    document
        .get_mut(VDU)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn set_or_remove(entry: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            entry.insert(key.into(), Value::String(value.to_string()));
        }
        None => {
            entry.remove(key);
        }
    }
}
