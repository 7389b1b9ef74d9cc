use crate::key::DeriveError;

use kube::api::ApiResource as KubeApiResource;
use kube::api::DynamicObject as KubeDynamicObject;
use kube::api::GroupVersionKind as KubeGroupVersionKind;
use std::fmt;

pub const GROUP: &str = "argoproj.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "Application";
pub const PLURAL: &str = "applications";

/*
 * Returns the ApiResource for argoproj.io/v1alpha1 applications. The mirror
 * never compiles against the Application schema, it treats every object as a
 * DynamicObject and only reads the few fields it needs for the key.
 */
pub fn api_resource() -> KubeApiResource {
    let gvk = KubeGroupVersionKind::gvk(GROUP, VERSION, KIND);
    KubeApiResource::from_gvk_with_plural(&gvk, PLURAL)
}

/*
 * managedFields changes on almost every server-side apply and carries
 * nothing a reader of the mirror wants.
 */
pub fn strip_transient(app: &mut KubeDynamicObject) {
    app.metadata.managed_fields = None;
}

/*
 * Immutable identity of an Application. Unlike the cache key it never
 * changes for the lifetime of the object.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppRef {
    pub namespace: String,
    pub name: String,
}

impl AppRef {

    pub fn new(namespace: &str, name: &str) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    name: name.to_string(),
	}
    }

    /*
     * Cluster-scoped lookups never happen for Applications, a missing
     * namespace only shows up on hand-built objects and maps to "".
     */
    pub fn from_object(app: &KubeDynamicObject) -> Result<Self, DeriveError> {
	let name = match &app.metadata.name {
	    Some(name) => name.clone(),
	    None => return Err(DeriveError::MissingField(String::from("metadata.name"))),
	};
	let namespace = app.metadata.namespace.clone().unwrap_or_default();

	Ok(Self{ namespace, name })
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{}/{}", self.namespace, self.name)
    }
}
