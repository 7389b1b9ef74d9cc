use crate::application::strip_transient;

use kube::api::DynamicObject as KubeDynamicObject;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DELIMITER: &str = "|";

#[derive(Error, Debug)]
pub enum DeriveError {

    /* a field the key format needs is absent (or not a string) */
    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("unable to encode application: {0}")]
    Encode(#[from] serde_json::Error),
}

/*
 * The layout of a mirror key. Changing the field order or the delimiter
 * of an existing format orphans every entry already written with it, so
 * new layouts are added as new variants instead.
 */
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum KeyFormat {
    /*
     * spec.project|metadata.name
     */
    #[default]
    ProjectName,

    /*
     * spec.project|metadata.name|spec.destination.namespace|spec.destination.server|spec.destination.name
     *
     * ArgoCD accepts either destination.server or destination.name, so both
     * of those may be empty.
     */
    Destination,
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    KeyFormat::ProjectName => write!(f, "project-name"),
	    KeyFormat::Destination => write!(f, "destination"),
	}
    }
}

impl FromStr for KeyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
	match s {
	    "project-name" => Ok(KeyFormat::ProjectName),
	    "destination" => Ok(KeyFormat::Destination),
	    other => Err(format!("unknown key format '{}': valid values are: project-name, destination", other)),
	}
    }
}

/*
 * A mirror entry ready to be written: the key and the JSON document.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

fn field<'a>(data: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
	.try_fold(data, |node, segment| node.get(*segment))
	.and_then(Value::as_str)
}

fn required(data: &Value, path: &[&str]) -> Result<String, DeriveError> {
    match field(data, path) {
	Some(value) => Ok(value.to_string()),
	None => Err(DeriveError::MissingField(path.join("."))),
    }
}

fn optional(data: &Value, path: &[&str]) -> String {
    field(data, path).unwrap_or_default().to_string()
}

pub fn derive_key(format: KeyFormat, app: &KubeDynamicObject) -> Result<String, DeriveError> {
    let project = required(&app.data, &["spec", "project"])?;
    let name = match &app.metadata.name {
	Some(name) => name.clone(),
	None => return Err(DeriveError::MissingField(String::from("metadata.name"))),
    };

    let parts = match format {
	KeyFormat::ProjectName => vec![project, name],
	KeyFormat::Destination => vec![
	    project,
	    name,
	    required(&app.data, &["spec", "destination", "namespace"])?,
	    optional(&app.data, &["spec", "destination", "server"]),
	    optional(&app.data, &["spec", "destination", "name"]),
	],
    };

    Ok(parts.join(DELIMITER))
}

/*
 * Strips the transient metadata off a copy of the application and returns
 * the key it lives under together with its serialized form.
 */
pub fn derive_entry(format: KeyFormat, app: &KubeDynamicObject) -> Result<Entry, DeriveError> {
    let key = derive_key(format, app)?;

    let mut app = app.clone();
    strip_transient(&mut app);
    let value = serde_json::to_string(&app)?;

    Ok(Entry{ key, value })
}
