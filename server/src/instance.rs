//! Secondary game servers ("instances") launched by a front-end server
//!
//! Each instance is a separate process of this same binary started with
//! `--instance` on its own port. The front-end only advertises them; clients
//! connect to an instance directly.

use crate::error::ServerError;
use log::{info, warn};
use shared::protocol::{
    InstanceInfo, InstanceList, INSTANCE_RUNNING, INSTANCE_STOPPED, MAX_LIST_INSTANCES,
};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};

/// Handle to a running instance.
pub trait InstanceProcess: Send {
    fn id(&self) -> u32;
    /// Polls without blocking; true once the process is gone.
    fn has_exited(&mut self) -> bool;
    fn kill(&mut self);
}

/// Starts instance processes.
pub trait InstanceLauncher: Send {
    fn launch(&self, port: u16) -> io::Result<Box<dyn InstanceProcess>>;
}

impl InstanceProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn has_exited(&mut self) -> bool {
        match self.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to poll instance process {}: {}", Child::id(self), e);
                true
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = Child::kill(self) {
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("Failed to stop instance process {}: {}", Child::id(self), e);
            }
        }
        let _ = self.wait();
    }
}

/// Re-executes the current binary in instance mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
    host: String,
}

impl ProcessLauncher {
    pub fn new(executable: PathBuf, host: impl Into<String>) -> Self {
        Self {
            executable,
            host: host.into(),
        }
    }

    pub fn current_exe(host: impl Into<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, host))
    }
}

impl InstanceLauncher for ProcessLauncher {
    fn launch(&self, port: u16) -> io::Result<Box<dyn InstanceProcess>> {
        let child = Command::new(&self.executable)
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--instance")
            .spawn()?;
        Ok(Box::new(child))
    }
}

struct InstanceEntry {
    port: u16,
    status: u8,
    process: Box<dyn InstanceProcess>,
}

/// Tracks the instances this server launched.
pub struct InstanceManager {
    launcher: Option<Box<dyn InstanceLauncher>>,
    port_base: u16,
    max_instances: usize,
    instances: Vec<InstanceEntry>,
}

impl InstanceManager {
    pub fn new(launcher: Box<dyn InstanceLauncher>, port_base: u16, max_instances: usize) -> Self {
        Self {
            launcher: Some(launcher),
            port_base,
            max_instances: max_instances.min(MAX_LIST_INSTANCES),
            instances: Vec::new(),
        }
    }

    /// A manager that refuses every launch; used by instance-mode servers.
    pub fn disabled() -> Self {
        Self {
            launcher: None,
            port_base: 0,
            max_instances: 0,
            instances: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.launcher.is_some()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn next_port(&self) -> Option<u16> {
        (0..self.max_instances as u16)
            .filter_map(|offset| self.port_base.checked_add(offset))
            .find(|port| self.instances.iter().all(|i| i.port != *port))
    }

    /// Launches a new instance on the first free port.
    pub fn create(&mut self) -> Result<InstanceInfo, ServerError> {
        let launcher = self.launcher.as_ref().ok_or(ServerError::InstancesDisabled)?;
        if self.instances.len() >= self.max_instances {
            return Err(ServerError::InstanceLimit(self.max_instances));
        }
        let port = self
            .next_port()
            .ok_or(ServerError::InstanceLimit(self.max_instances))?;

        let process = launcher
            .launch(port)
            .map_err(|source| ServerError::InstanceLaunch { port, source })?;
        info!("Launched instance pid {} on port {}", process.id(), port);

        self.instances.push(InstanceEntry {
            port,
            status: INSTANCE_RUNNING,
            process,
        });
        Ok(InstanceInfo {
            port,
            status: INSTANCE_RUNNING,
        })
    }

    pub fn list(&self) -> InstanceList {
        let mut list = InstanceList::default();
        for (slot, entry) in self.instances.iter().take(MAX_LIST_INSTANCES).enumerate() {
            list.instances[slot] = InstanceInfo {
                port: entry.port,
                status: entry.status,
            };
            list.count += 1;
        }
        list
    }

    /// Forgets instances whose process has exited and returns their ports.
    pub fn reap(&mut self) -> Vec<u16> {
        let mut reaped = Vec::new();
        self.instances.retain_mut(|entry| {
            if entry.process.has_exited() {
                entry.status = INSTANCE_STOPPED;
                info!("Instance on port {} exited", entry.port);
                reaped.push(entry.port);
                false
            } else {
                true
            }
        });
        reaped
    }

    pub fn shutdown_all(&mut self) {
        for mut entry in self.instances.drain(..) {
            info!("Stopping instance on port {}", entry.port);
            entry.process.kill();
        }
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeLauncher {
        launched: Arc<AtomicU32>,
        exited: Arc<AtomicBool>,
        killed: Arc<AtomicU32>,
        fail: bool,
    }

    struct FakeProcess {
        id: u32,
        exited: Arc<AtomicBool>,
        killed: Arc<AtomicU32>,
    }

    impl InstanceProcess for FakeProcess {
        fn id(&self) -> u32 {
            self.id
        }

        fn has_exited(&mut self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        fn kill(&mut self) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InstanceLauncher for FakeLauncher {
        fn launch(&self, _port: u16) -> io::Result<Box<dyn InstanceProcess>> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no binary"));
            }
            let id = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(FakeProcess {
                id,
                exited: Arc::clone(&self.exited),
                killed: Arc::clone(&self.killed),
            }))
        }
    }

    #[test]
    fn test_create_assigns_sequential_ports_up_to_limit() {
        let launcher = FakeLauncher::default();
        let mut manager = InstanceManager::new(Box::new(launcher.clone()), 8081, 2);

        assert_eq!(manager.create().unwrap().port, 8081);
        assert_eq!(manager.create().unwrap().port, 8082);
        assert!(matches!(manager.create(), Err(ServerError::InstanceLimit(2))));

        let list = manager.list();
        assert_eq!(list.count, 2);
        let ports: Vec<u16> = list.entries().iter().map(|i| i.port).collect();
        assert_eq!(ports, vec![8081, 8082]);
        assert!(list.entries().iter().all(|i| i.status == INSTANCE_RUNNING));
    }

    #[test]
    fn test_disabled_manager_refuses() {
        let mut manager = InstanceManager::disabled();
        assert!(!manager.is_enabled());
        assert!(matches!(manager.create(), Err(ServerError::InstancesDisabled)));
        assert_eq!(manager.list().count, 0);
    }

    #[test]
    fn test_launch_failure_reports_port() {
        let launcher = FakeLauncher {
            fail: true,
            ..FakeLauncher::default()
        };
        let mut manager = InstanceManager::new(Box::new(launcher), 9100, 4);
        match manager.create() {
            Err(ServerError::InstanceLaunch { port, .. }) => assert_eq!(port, 9100),
            _ => panic!("expected launch failure"),
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn test_reap_frees_ports() {
        let launcher = FakeLauncher::default();
        let mut manager = InstanceManager::new(Box::new(launcher.clone()), 8081, 4);
        manager.create().unwrap();
        assert!(manager.reap().is_empty());

        launcher.exited.store(true, Ordering::SeqCst);
        assert_eq!(manager.reap(), vec![8081]);
        assert!(manager.is_empty());

        launcher.exited.store(false, Ordering::SeqCst);
        assert_eq!(manager.create().unwrap().port, 8081);
    }

    #[test]
    fn test_drop_kills_children() {
        let launcher = FakeLauncher::default();
        {
            let mut manager = InstanceManager::new(Box::new(launcher.clone()), 8081, 4);
            manager.create().unwrap();
            manager.create().unwrap();
        }
        assert_eq!(launcher.killed.load(Ordering::SeqCst), 2);
    }
}
