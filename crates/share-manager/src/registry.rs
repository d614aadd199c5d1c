use {
    crate::{
        config::Config,
        error::Error,
        manager::{Manager, ShareManaging},
    },
    blob_store::BlobStore,
    std::{collections::HashMap, sync::Arc},
};

/// Builds a manager from a blob-store handle and the parsed configuration.
pub type Factory =
    fn(Arc<dyn BlobStore>, &Config) -> Result<Arc<dyn ShareManaging>, Error>;

/// Registry of share-manager drivers, instantiated by name.
///
/// The blob-backed manager registers itself as `jsonblob`; embedding
/// services can register additional drivers before instantiating.
pub struct Registry {
    drivers: HashMap<&'static str, Factory>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self {
            drivers: HashMap::default(),
        };
        registry.register("jsonblob", |store, config| {
            Ok(Arc::new(Manager::new(store, config)))
        });
        registry
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, factory: Factory) {
        self.drivers.insert(name, factory);
    }

    pub fn instantiate(
        &self,
        name: &str,
        store: Arc<dyn BlobStore>,
        config: &Config,
    ) -> Result<Arc<dyn ShareManaging>, Error> {
        let factory = self
            .drivers
            .get(name)
            .ok_or_else(|| Error::invalid(format!("unknown driver {name}")))?;
        factory(store, config)
    }
}
