//! Loader boundary.
//!
//! The service-description parser is an external collaborator; the core
//! asks a [`ServiceLoader`] for records by name and for reloads. The
//! crate ships an in-memory loader over pre-resolved settings, used by
//! the daemon and by tests. Cyclic service descriptions are detected by
//! inserting a placeholder record while a load is in flight.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use tracing::debug;

use crate::error::LoadError;
use crate::service::{ServiceId, ServiceSet};
use crate::settings::{ServiceKind, ServiceSettings};

/// Loader mechanism tag: in-memory registry of resolved settings.
pub const LOADER_TYPE_MEMORY: u8 = 1;

/// Description of the loader mechanism (QueryLoadMech).
#[derive(Debug, Clone)]
pub struct LoaderInfo {
    /// Mechanism tag.
    pub mech: u8,
    /// Current working directory the service directories are relative
    /// to.
    pub cwd: PathBuf,
    /// Configured service description directories.
    pub service_dirs: Vec<PathBuf>,
}

/// Produces and reloads service records on demand.
pub trait ServiceLoader {
    /// Loads (or finds) the named service, creating records for its
    /// dependencies as needed.
    fn load(&mut self, set: &mut ServiceSet, name: &str) -> Result<ServiceId, LoadError>;

    /// Re-reads the description of a loaded service. Returns the id of
    /// the record now carrying the service, which may differ from
    /// `sid` if the record had to be replaced.
    fn reload(&mut self, set: &mut ServiceSet, sid: ServiceId)
        -> Result<ServiceId, LoadError>;

    /// Describes the loader mechanism.
    fn describe(&self) -> LoaderInfo;
}

/// Loader over an in-memory registry of resolved settings.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    registry: HashMap<String, ServiceSettings>,
    service_dirs: Vec<PathBuf>,
}

impl MemoryLoader {
    /// Creates an empty loader.
    pub fn new() -> MemoryLoader {
        MemoryLoader::default()
    }

    /// Registers (or replaces) the settings for a service name.
    pub fn insert(&mut self, name: impl Into<String>, settings: ServiceSettings) {
        self.registry.insert(name.into(), settings);
    }

    /// Records the directories descriptions notionally come from (for
    /// QueryLoadMech).
    pub fn set_service_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.service_dirs = dirs;
    }

    fn load_with_placeholder(
        &mut self,
        set: &mut ServiceSet,
        name: &str,
    ) -> Result<ServiceId, LoadError> {
        if let Some(sid) = set.find(name) {
            if set.rec(sid).kind() == ServiceKind::Placeholder {
                // Hit a record currently being loaded further up the
                // stack: the description graph is cyclic.
                return Err(LoadError::CyclicDependency(name.to_owned()));
            }
            return Ok(sid);
        }

        let settings = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_owned()))?;

        // Placeholder marks the load in flight for cycle detection.
        let sid = set.add_service(
            name,
            ServiceSettings { kind: ServiceKind::Placeholder, ..ServiceSettings::default() },
        );

        let mut dep_ids = Vec::with_capacity(settings.depends.len());
        for dep in &settings.depends {
            match self.load_with_placeholder(set, &dep.to) {
                Ok(dep_sid) => dep_ids.push((dep_sid, dep.kind)),
                Err(err) => {
                    set.remove_service(sid).ok();
                    return Err(err);
                }
            }
        }

        set.promote_placeholder(sid, settings);
        for (dep_sid, kind) in dep_ids {
            set.add_dep(sid, dep_sid, kind);
        }
        debug!("loaded service {name}");
        Ok(sid)
    }
}

impl ServiceLoader for MemoryLoader {
    fn load(&mut self, set: &mut ServiceSet, name: &str) -> Result<ServiceId, LoadError> {
        self.load_with_placeholder(set, name)
    }

    fn reload(
        &mut self,
        set: &mut ServiceSet,
        sid: ServiceId,
    ) -> Result<ServiceId, LoadError> {
        let name = set.rec(sid).name().to_owned();
        let settings = self
            .registry
            .get(&name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.clone()))?;

        use crate::proto::ServiceState;
        match set.rec(sid).state() {
            ServiceState::Stopped => {
                // Resolve dependencies first so a load failure leaves
                // the old record intact.
                let mut dep_ids = Vec::with_capacity(settings.depends.len());
                for dep in &settings.depends {
                    dep_ids.push((self.load(set, &dep.to)?, dep.kind));
                }
                let new_sid = if set.rec(sid).kind() == settings.kind {
                    set.unlink_dependencies(sid);
                    set.update_settings(sid, settings)?;
                    sid
                } else {
                    set.replace_record(sid, settings)?
                };
                for (dep_sid, kind) in dep_ids {
                    if set.find_dep(new_sid, dep_sid, kind).is_none() {
                        set.add_dep(new_sid, dep_sid, kind);
                    }
                }
                Ok(new_sid)
            }
            ServiceState::Started => {
                // A started record only accepts settings deltas; the
                // dependency set must be unchanged.
                let current: Vec<_> = set
                    .rec(sid)
                    .depends_on()
                    .iter()
                    .map(|&eid| {
                        let e = set.edge(eid);
                        (set.rec(e.to).name().to_owned(), e.kind)
                    })
                    .collect();
                let wanted: Vec<_> = settings
                    .depends
                    .iter()
                    .map(|d| (d.to.clone(), d.kind))
                    .collect();
                if current != wanted {
                    return Err(LoadError::Description {
                        service: name,
                        detail: "dependencies cannot change while started".into(),
                        line: None,
                    });
                }
                set.update_settings(sid, settings)?;
                Ok(sid)
            }
            _ => Err(LoadError::Description {
                service: name,
                detail: "service is transitioning; try again later".into(),
                line: None,
            }),
        }
    }

    fn describe(&self) -> LoaderInfo {
        LoaderInfo {
            mech: LOADER_TYPE_MEMORY,
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            service_dirs: self.service_dirs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::DepKind;

    #[test]
    fn load_links_dependencies() {
        let mut set = ServiceSet::new();
        let mut loader = MemoryLoader::new();
        loader.insert("a", ServiceSettings::internal());
        loader.insert("b", ServiceSettings::internal().with_dep("a", DepKind::Regular));

        let b = loader.load(&mut set, "b").unwrap();
        let a = set.find("a").expect("dependency loaded too");
        assert_eq!(set.rec(b).depends_on().len(), 1);
        let eid = set.rec(b).depends_on()[0];
        assert_eq!(set.edge(eid).to, a);
        assert_eq!(set.edge(eid).kind, DepKind::Regular);

        // A second load finds the same record.
        assert_eq!(loader.load(&mut set, "b").unwrap(), b);
    }

    #[test]
    fn missing_service_reports_not_found() {
        let mut set = ServiceSet::new();
        let mut loader = MemoryLoader::new();
        assert!(matches!(
            loader.load(&mut set, "ghost"),
            Err(LoadError::NotFound(_))
        ));
    }

    #[test]
    fn cyclic_description_is_rejected() {
        let mut set = ServiceSet::new();
        let mut loader = MemoryLoader::new();
        loader.insert("a", ServiceSettings::internal().with_dep("b", DepKind::Regular));
        loader.insert("b", ServiceSettings::internal().with_dep("a", DepKind::Regular));

        assert!(matches!(
            loader.load(&mut set, "a"),
            Err(LoadError::CyclicDependency(_))
        ));
        // The failed load leaves no placeholder debris behind.
        assert!(set.find("a").is_none());
        assert!(set.find("b").is_none());
    }
}
