//! Plugin capability flags and the consumer registry.
//!
//! Every known plugin kind owns one bit of a `u64` flag word. Configuration
//! selects the active set by name; the bit table is persisted alongside
//! deployments, so a kind's bit never changes once assigned.

use crate::consumer::{TraceConsumer, TraceConsumerBoxed};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),
    #[error("plugin {0} is a producer and cannot consume events")]
    NotAConsumer(PluginKind),
    #[error("a consumer is already registered for plugin {0}")]
    AlreadyRegistered(PluginKind),
}

macro_rules! plugin_kinds {
    ($($kind:ident = $bit:expr, $role:ident;)+) => {
        /// Known producer and consumer plugins.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum PluginKind {
            $($kind,)+
        }

        impl PluginKind {
            /// Every kind, in bit order.
            pub const ALL: &'static [PluginKind] = &[$(PluginKind::$kind,)+];

            /// Bit position in the flag word.
            pub const fn bit(self) -> u32 {
                match self {
                    $(PluginKind::$kind => $bit,)+
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(PluginKind::$kind => stringify!($kind),)+
                }
            }

            pub const fn role(self) -> PluginRole {
                match self {
                    $(PluginKind::$kind => PluginRole::$role,)+
                }
            }

            /// Looks a kind up by its configuration name.
            pub fn from_name(name: &str) -> Result<Self, RegistryError> {
                match name {
                    $(stringify!($kind) => Ok(PluginKind::$kind),)+
                    other => Err(RegistryError::UnknownPlugin(other.to_string())),
                }
            }
        }
    };
}

plugin_kinds! {
    EtlFileProducer = 0, Producer;
    EtlInMemoryProducer = 1, Producer;
    FolderProducer = 2, Producer;
    AzureBlobCsvUploader = 3, Consumer;
    AzureBlobEtwCsvUploader = 4, Consumer;
    AzureTableQueryableEventUploader = 5, Consumer;
    AzureTableSelectiveEventUploader = 6, Consumer;
    AzureTableQueryableCsvUploader = 7, Consumer;
    AzureBlobFolderUploader = 8, Consumer;
    FileShareEtwCsvUploader = 9, Consumer;
    FileShareFolderUploader = 10, Consumer;
    MdsEtwEventUploader = 11, Consumer;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginRole {
    Producer,
    Consumer,
}

impl PluginKind {
    pub const fn flag(self) -> PluginFlags {
        PluginFlags(1 << self.bit())
    }

    pub fn is_consumer(self) -> bool {
        self.role() == PluginRole::Consumer
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PluginKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// A set of plugin kinds as a flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PluginFlags(u64);

impl PluginFlags {
    pub const NONE: PluginFlags = PluginFlags(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, kind: PluginKind) -> bool {
        self.0 & (1 << kind.bit()) != 0
    }

    pub fn insert(&mut self, kind: PluginKind) {
        self.0 |= kind.flag().0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Kinds in the set, in bit order. Bits without a known kind are skipped.
    pub fn iter(self) -> impl Iterator<Item = PluginKind> {
        PluginKind::ALL.iter().copied().filter(move |k| self.contains(*k))
    }

    /// Builds a flag word from configuration names. Unknown names are rejected.
    pub fn from_names<I, S>(names: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::NONE, |flags, name| {
            Ok(flags | PluginKind::from_name(name.as_ref())?)
        })
    }
}

impl From<PluginKind> for PluginFlags {
    fn from(kind: PluginKind) -> Self {
        kind.flag()
    }
}

impl<T: Into<PluginFlags>> BitOr<T> for PluginFlags {
    type Output = PluginFlags;

    fn bitor(self, rhs: T) -> PluginFlags {
        PluginFlags(self.0 | rhs.into().0)
    }
}

impl BitOr for PluginKind {
    type Output = PluginFlags;

    fn bitor(self, rhs: PluginKind) -> PluginFlags {
        self.flag() | rhs
    }
}

impl<T: Into<PluginFlags>> BitOrAssign<T> for PluginFlags {
    fn bitor_assign(&mut self, rhs: T) {
        self.0 |= rhs.into().0;
    }
}

/// A consumer selected for a pass.
#[derive(Clone)]
pub struct ActiveConsumer {
    pub kind: PluginKind,
    pub consumer: Arc<dyn TraceConsumerBoxed>,
}

impl ActiveConsumer {
    pub fn name(&self) -> &str {
        self.consumer.name()
    }
}

impl fmt::Debug for ActiveConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveConsumer")
            .field("kind", &self.kind)
            .field("name", &self.name())
            .finish()
    }
}

/// Consumers by plugin kind, at most one per kind.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: Vec<ActiveConsumer>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: TraceConsumer + 'static>(&mut self, kind: PluginKind, consumer: C) -> Result<(), RegistryError> {
        self.register_shared(kind, Arc::new(consumer))
    }

    /// Registers a consumer the caller keeps a handle to.
    pub fn register_shared(&mut self, kind: PluginKind, consumer: Arc<dyn TraceConsumerBoxed>) -> Result<(), RegistryError> {
        if !kind.is_consumer() {
            return Err(RegistryError::NotAConsumer(kind));
        }
        if self.consumers.iter().any(|c| c.kind == kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.consumers.push(ActiveConsumer { kind, consumer });
        self.consumers.sort_by_key(|c| c.kind.bit());
        Ok(())
    }

    /// Registered consumers enabled in `flags`, in bit order.
    pub fn active(&self, flags: PluginFlags) -> Vec<ActiveConsumer> {
        self.consumers
            .iter()
            .filter(|c| flags.contains(c.kind))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.consumers).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::MemoryConsumer;
    use std::collections::HashSet;

    #[test]
    fn test_bits_are_unique_and_stable() {
        let bits: HashSet<u32> = PluginKind::ALL.iter().map(|k| k.bit()).collect();
        assert_eq!(bits.len(), PluginKind::ALL.len());
        assert!(PluginKind::ALL.iter().all(|k| k.bit() < 64));

        // Persisted configuration depends on these.
        assert_eq!(PluginKind::EtlFileProducer.flag().bits(), 1);
        assert_eq!(PluginKind::AzureBlobCsvUploader.flag().bits(), 1 << 3);
        assert_eq!(PluginKind::MdsEtwEventUploader.flag().bits(), 1 << 11);
    }

    #[test]
    fn test_names_round_trip() {
        for kind in PluginKind::ALL {
            assert_eq!(PluginKind::from_name(kind.name()), Ok(*kind));
            assert_eq!(kind.to_string().parse::<PluginKind>(), Ok(*kind));
        }
        assert_eq!(
            PluginKind::from_name("AzureBlobCsvUploaderV2"),
            Err(RegistryError::UnknownPlugin("AzureBlobCsvUploaderV2".into()))
        );
    }

    #[test]
    fn test_flags() {
        let flags = PluginKind::EtlFileProducer | PluginKind::AzureBlobCsvUploader;
        assert!(flags.contains(PluginKind::EtlFileProducer));
        assert!(!flags.contains(PluginKind::FolderProducer));
        assert_eq!(
            flags.iter().collect::<Vec<_>>(),
            vec![PluginKind::EtlFileProducer, PluginKind::AzureBlobCsvUploader]
        );

        let parsed = PluginFlags::from_names(["AzureBlobCsvUploader", "EtlFileProducer"]).unwrap();
        assert_eq!(parsed, flags);
        assert!(PluginFlags::from_names(["EtlFileProducer", "Nope"]).is_err());

        let mut more = PluginFlags::NONE;
        more |= PluginKind::FolderProducer;
        more.insert(PluginKind::MdsEtwEventUploader);
        assert_eq!(more.bits(), (1 << 2) | (1 << 11));
    }

    #[test]
    fn test_registry_active_subset() {
        let mut registry = ConsumerRegistry::new();
        registry
            .register(PluginKind::FileShareEtwCsvUploader, MemoryConsumer::new("share"))
            .unwrap();
        registry
            .register(PluginKind::AzureBlobCsvUploader, MemoryConsumer::new("blob"))
            .unwrap();

        assert_eq!(
            registry.register(PluginKind::AzureBlobCsvUploader, MemoryConsumer::new("dup")),
            Err(RegistryError::AlreadyRegistered(PluginKind::AzureBlobCsvUploader))
        );
        assert_eq!(
            registry.register(PluginKind::EtlFileProducer, MemoryConsumer::new("producer")),
            Err(RegistryError::NotAConsumer(PluginKind::EtlFileProducer))
        );

        let all = registry.active(PluginKind::FileShareEtwCsvUploader | PluginKind::AzureBlobCsvUploader);
        let names: Vec<_> = all.iter().map(ActiveConsumer::name).collect();
        assert_eq!(names, vec!["blob", "share"]);

        let some = registry.active(PluginKind::FileShareEtwCsvUploader.flag());
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name(), "share");

        assert!(registry.active(PluginFlags::NONE).is_empty());
    }
}
