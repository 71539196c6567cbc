//! Protocol catalog: the in-memory descriptor tree behind both the server
//! dispatch table and the client call surface.
//!
//! Entries are tagged at load time as callable services or plain message
//! types; downstream code never guesses from names. Catalogs come from a
//! serialized protobuf `FileDescriptorSet` (the output of
//! `protoc --descriptor_set_out`) or from the in-memory [`builder`].
//!
//! [`builder`]: ProtoCatalog::builder

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use prost::Message;
use prost_types::FileDescriptorSet;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read descriptor set '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode descriptor set '{path}': {source}")]
    Decode {
        path: String,
        #[source]
        source: prost::DecodeError,
    },
}

/// A callable remote service: its name and unary method set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeSet<String>,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }
}

/// A descriptor entry, tagged when the definition is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoEntry {
    /// A remotely callable service definition.
    Service(ServiceDescriptor),
    /// A plain data type; never materialized into a client.
    Message,
}

/// Descriptor tree keyed by package, then entry name.
#[derive(Debug, Clone, Default)]
pub struct ProtoCatalog {
    packages: HashMap<String, BTreeMap<String, ProtoEntry>>,
}

impl ProtoCatalog {
    /// Decode a catalog from serialized `FileDescriptorSet` bytes.
    ///
    /// # Errors
    /// Returns [`CatalogError::Decode`] when the bytes are not a valid
    /// descriptor set. The given `origin` names the source in errors.
    pub fn from_descriptor_set_bytes(origin: &str, bytes: &[u8]) -> Result<Self, CatalogError> {
        let set = FileDescriptorSet::decode(bytes).map_err(|e| CatalogError::Decode {
            path: origin.to_owned(),
            source: e,
        })?;
        Ok(Self::from_descriptor_set(&set))
    }

    /// Load a catalog from a descriptor-set file on disk.
    ///
    /// # Errors
    /// Returns [`CatalogError::Read`] on I/O failure and
    /// [`CatalogError::Decode`] when the file is not a descriptor set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| CatalogError::Read {
            path: shown.clone(),
            source: e,
        })?;
        Self::from_descriptor_set_bytes(&shown, &bytes)
    }

    /// Build a catalog from an already-decoded descriptor set.
    pub fn from_descriptor_set(set: &FileDescriptorSet) -> Self {
        let mut catalog = Self::default();
        for file in &set.file {
            let package = catalog.packages.entry(file.package().to_owned()).or_default();
            for message in &file.message_type {
                package.insert(message.name().to_owned(), ProtoEntry::Message);
            }
            for service in &file.service {
                let methods = service
                    .method
                    .iter()
                    .map(|m| m.name().to_owned())
                    .collect::<BTreeSet<_>>();
                package.insert(
                    service.name().to_owned(),
                    ProtoEntry::Service(ServiceDescriptor {
                        name: service.name().to_owned(),
                        methods,
                    }),
                );
            }
        }
        catalog
    }

    pub fn builder() -> ProtoCatalogBuilder {
        ProtoCatalogBuilder::default()
    }

    /// Look up the service descriptor at `{ns}.{name}`, if any. A message
    /// entry under that name is not a service.
    pub fn service(&self, ns: &str, name: &str) -> Option<&ServiceDescriptor> {
        match self.packages.get(ns)?.get(name)? {
            ProtoEntry::Service(descriptor) => Some(descriptor),
            ProtoEntry::Message => None,
        }
    }

    /// All callable service descriptors under `ns`, in name order.
    pub fn services_in<'a>(&'a self, ns: &str) -> impl Iterator<Item = &'a ServiceDescriptor> {
        self.packages
            .get(ns)
            .into_iter()
            .flat_map(|entries| entries.values())
            .filter_map(|entry| match entry {
                ProtoEntry::Service(descriptor) => Some(descriptor),
                ProtoEntry::Message => None,
            })
    }
}

/// In-memory catalog construction, mainly for embedded definitions and
/// tests.
#[derive(Debug, Default)]
pub struct ProtoCatalogBuilder {
    catalog: ProtoCatalog,
}

impl ProtoCatalogBuilder {
    /// Declare a callable service with its unary methods.
    #[must_use]
    pub fn service<'a>(
        mut self,
        ns: &str,
        name: &str,
        methods: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let descriptor = ServiceDescriptor {
            name: name.to_owned(),
            methods: methods.into_iter().map(str::to_owned).collect(),
        };
        self.catalog
            .packages
            .entry(ns.to_owned())
            .or_default()
            .insert(name.to_owned(), ProtoEntry::Service(descriptor));
        self
    }

    /// Declare a plain message type.
    #[must_use]
    pub fn message(mut self, ns: &str, name: &str) -> Self {
        self.catalog
            .packages
            .entry(ns.to_owned())
            .or_default()
            .insert(name.to_owned(), ProtoEntry::Message);
        self
    }

    pub fn build(self) -> ProtoCatalog {
        self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{
        DescriptorProto, FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto,
    };

    fn sample_descriptor_set() -> FileDescriptorSet {
        FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("proj.proto".to_owned()),
                package: Some("proj".to_owned()),
                message_type: vec![
                    DescriptorProto {
                        name: Some("EchoRequest".to_owned()),
                        ..Default::default()
                    },
                    DescriptorProto {
                        name: Some("EchoReply".to_owned()),
                        ..Default::default()
                    },
                ],
                service: vec![ServiceDescriptorProto {
                    name: Some("App".to_owned()),
                    method: vec![
                        MethodDescriptorProto {
                            name: Some("Echo".to_owned()),
                            ..Default::default()
                        },
                        MethodDescriptorProto {
                            name: Some("Whoami".to_owned()),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn descriptor_set_entries_are_tagged_by_kind() {
        let catalog = ProtoCatalog::from_descriptor_set(&sample_descriptor_set());

        let app = catalog.service("proj", "App").expect("App is a service");
        assert!(app.has_method("Echo"));
        assert!(app.has_method("Whoami"));
        assert!(!app.has_method("Missing"));

        // Message types never resolve as services.
        assert!(catalog.service("proj", "EchoRequest").is_none());
    }

    #[test]
    fn encoded_descriptor_set_round_trips() {
        let bytes = sample_descriptor_set().encode_to_vec();
        let catalog = ProtoCatalog::from_descriptor_set_bytes("inline", &bytes).unwrap();
        assert!(catalog.service("proj", "App").is_some());
    }

    #[test]
    fn invalid_bytes_fail_with_the_origin_in_the_error() {
        let err = ProtoCatalog::from_descriptor_set_bytes("bad.bin", &[0xff, 0xff, 0xff])
            .expect_err("garbage should not decode");
        assert!(
            err.to_string().contains("bad.bin"),
            "error should name the source: {err}"
        );
    }

    #[test]
    fn load_reports_missing_file_by_path() {
        let err = ProtoCatalog::load("/definitely/not/here.bin").expect_err("should fail");
        assert!(matches!(err, CatalogError::Read { .. }));
        assert!(err.to_string().contains("not/here.bin"));
    }

    #[test]
    fn services_in_skips_plain_data_types() {
        let catalog = ProtoCatalog::builder()
            .service("proj", "App", ["Echo"])
            .service("proj", "Worker", ["Run"])
            .message("proj", "Payload")
            .message("other", "Elsewhere")
            .build();

        let names: Vec<&str> = catalog.services_in("proj").map(ServiceDescriptor::name).collect();
        assert_eq!(names, vec!["App", "Worker"]);
        assert_eq!(catalog.services_in("missing").count(), 0);
    }

    #[test]
    fn unknown_package_has_no_services() {
        let catalog = ProtoCatalog::builder().service("proj", "App", ["Echo"]).build();
        assert!(catalog.service("other", "App").is_none());
        assert!(catalog.service("proj", "Other").is_none());
    }
}
