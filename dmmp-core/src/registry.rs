// vim: tw=80
//! Lookup tables for path selectors and hardware handlers, by name

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    hw_handler::HwHandler,
    path_selector::{PathSelector, QueueLength, RoundRobin},
    table::TableError,
    types::*,
};

/// Builds a path selector from its table arguments
pub type SelectorFactory = Box<dyn Fn(&[String])
    -> std::result::Result<Box<dyn PathSelector>, TableError> + Send + Sync>;

/// Builds a hardware handler from its table arguments
pub type HwHandlerFactory = Box<dyn Fn(&[String])
    -> std::result::Result<Arc<dyn HwHandler>, TableError> + Send + Sync>;

/// Every path selector and hardware handler that a table may name.
///
/// The default registry knows the built-in selectors and no hardware
/// handlers.
pub struct Registry {
    selectors: BTreeMap<String, SelectorFactory>,
    hw_handlers: BTreeMap<String, HwHandlerFactory>,
}

impl Registry {
    /// Instantiate the hardware handler called `name`
    pub fn hw_handler(&self, name: &str, args: &[String])
        -> std::result::Result<Arc<dyn HwHandler>, TableError>
    {
        let factory = self.hw_handlers.get(name)
            .ok_or_else(|| TableError::UnknownHwHandler(name.to_owned()))?;
        factory(args)
    }

    /// A registry with nothing in it
    pub fn empty() -> Self {
        Registry {
            selectors: BTreeMap::new(),
            hw_handlers: BTreeMap::new()
        }
    }

    pub fn register_hw_handler<F>(&mut self, name: &str, factory: F)
        -> Result<()>
        where F: Fn(&[String])
                -> std::result::Result<Arc<dyn HwHandler>, TableError>
            + Send + Sync + 'static
    {
        if self.hw_handlers.contains_key(name) {
            return Err(Error::EEXIST);
        }
        self.hw_handlers.insert(name.to_owned(), Box::new(factory));
        Ok(())
    }

    pub fn register_selector<F>(&mut self, name: &str, factory: F)
        -> Result<()>
        where F: Fn(&[String])
                -> std::result::Result<Box<dyn PathSelector>, TableError>
            + Send + Sync + 'static
    {
        if self.selectors.contains_key(name) {
            return Err(Error::EEXIST);
        }
        self.selectors.insert(name.to_owned(), Box::new(factory));
        Ok(())
    }

    /// Instantiate the path selector called `name`
    pub fn selector(&self, name: &str, args: &[String])
        -> std::result::Result<Box<dyn PathSelector>, TableError>
    {
        let factory = self.selectors.get(name)
            .ok_or_else(|| TableError::UnknownSelector(name.to_owned()))?;
        factory(args)
    }

    /// Names of all registered selectors
    pub fn selectors(&self) -> impl Iterator<Item=&str> {
        self.selectors.keys().map(String::as_str)
    }
}

impl Default for Registry {
    fn default() -> Self {
        fn round_robin(_args: &[String])
            -> std::result::Result<Box<dyn PathSelector>, TableError>
        {
            Ok(Box::new(RoundRobin::new()))
        }

        fn queue_length(_args: &[String])
            -> std::result::Result<Box<dyn PathSelector>, TableError>
        {
            Ok(Box::new(QueueLength::new()))
        }

        let mut r = Registry::empty();
        r.selectors.insert(RoundRobin::NAME.to_owned(), Box::new(round_robin));
        r.selectors.insert(QueueLength::NAME.to_owned(),
                           Box::new(queue_length));
        r
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("selectors", &self.selectors.keys().collect::<Vec<_>>())
            .field("hw_handlers", &self.hw_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// LCOV_EXCL_STOP
