// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Table of open instances and the interception state they share.
//!
//! The first instance opened through a registry decides whether an
//! interceptor replaces the operation table; the table is finalized when
//! the last instance closes. Opening a descriptor that is already open
//! returns the existing instance.

use crate::api::{Interceptor, ScalOps};
use crate::error::{ScalError, ScalResult};
use crate::instance::ScalInstance;
use parking_lot::Mutex;
use std::sync::Arc;

struct Plugin {
    interceptor: Arc<dyn Interceptor>,
    table: Arc<dyn ScalOps>,
}

#[derive(Default)]
struct RegistryState {
    instances: Vec<Arc<ScalInstance>>,
    plugin: Option<Plugin>,
}

impl RegistryState {
    fn find(&self, fd: i32) -> Option<Arc<ScalInstance>> {
        self.instances.iter().find(|i| i.fd() == fd).cloned()
    }
}

/// Open instances keyed by device descriptor.
#[derive(Default)]
pub struct InstanceRegistry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InstanceRegistry")
            .field("instances", &state.instances.len())
            .field("intercepted", &state.plugin.is_some())
            .finish()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fd: i32) -> Option<Arc<ScalInstance>> {
        self.state.lock().find(fd)
    }

    pub fn len(&self) -> usize {
        self.state.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replacement operation table, while one is installed.
    pub fn ops(&self) -> Option<Arc<dyn ScalOps>> {
        self.state.lock().plugin.as_ref().map(|p| Arc::clone(&p.table))
    }

    /// Return the instance for `fd`, building it with `create` if needed.
    ///
    /// `create` runs without the registry lock held. If another thread
    /// registered the same descriptor meanwhile, its instance wins.
    pub(crate) fn open<F>(
        &self,
        fd: i32,
        interceptor: Option<&Arc<dyn Interceptor>>,
        builtin: &Arc<dyn ScalOps>,
        create: F,
    ) -> ScalResult<Arc<ScalInstance>>
    where
        F: FnOnce() -> ScalResult<ScalInstance>,
    {
        if let Some(existing) = self.get(fd) {
            log::debug!("scal fd {fd}: already open");
            return Ok(existing);
        }

        let instance = Arc::new(create()?);
        let mut state = self.state.lock();
        if let Some(existing) = state.find(fd) {
            log::debug!("scal fd {fd}: opened concurrently, keeping the first instance");
            return Ok(existing);
        }

        if state.instances.is_empty() && instance.config().intercept {
            if let Some(interceptor) = interceptor {
                match interceptor.ops(Arc::clone(builtin)) {
                    Some(table) => {
                        log::info!("scal: operation table replaced by interceptor");
                        state.plugin = Some(Plugin {
                            interceptor: Arc::clone(interceptor),
                            table,
                        });
                    }
                    None => log::warn!("scal: interceptor unavailable, using built-in operations"),
                }
            }
        }

        state.instances.push(Arc::clone(&instance));
        Ok(instance)
    }

    /// Remove `instance`; the last close finalizes the interception state.
    pub(crate) fn close(&self, instance: &Arc<ScalInstance>) -> ScalResult<()> {
        let plugin = {
            let mut state = self.state.lock();
            let pos = state
                .instances
                .iter()
                .position(|i| Arc::ptr_eq(i, instance))
                .ok_or_else(|| ScalError::not_found("instance", instance.fd().to_string()))?;
            state.instances.remove(pos);
            if state.instances.is_empty() {
                state.plugin.take()
            } else {
                None
            }
        };

        if let Some(plugin) = plugin {
            log::info!("scal: last instance closed, finalizing interceptor");
            plugin.interceptor.finish();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BuiltinOps;
    use crate::config::RuntimeConfig;
    use crate::driver::DeviceDriver;
    use crate::instance::tests::topology;
    use crate::sim::SimDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingInterceptor {
        installs: AtomicUsize,
        finishes: AtomicUsize,
    }

    struct Wrapped;
    impl ScalOps for Wrapped {}

    impl Interceptor for CountingInterceptor {
        fn ops(&self, _builtin: Arc<dyn ScalOps>) -> Option<Arc<dyn ScalOps>> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(Wrapped))
        }

        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create(fd: i32, config: RuntimeConfig) -> impl FnOnce() -> ScalResult<ScalInstance> {
        move || {
            let driver: Arc<dyn DeviceDriver> = Arc::new(SimDevice::new());
            ScalInstance::create(fd, &topology(), driver, config)
        }
    }

    fn intercepting() -> RuntimeConfig {
        RuntimeConfig {
            intercept: true,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_same_fd_is_deduplicated() {
        let reg = InstanceRegistry::new();
        let builtin: Arc<dyn ScalOps> = Arc::new(BuiltinOps);
        let a = reg.open(5, None, &builtin, create(5, RuntimeConfig::default())).unwrap();
        let b = reg
            .open(5, None, &builtin, || panic!("must not build a second instance"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(5).is_some());
        reg.close(&a).unwrap();
        assert!(reg.is_empty());
        assert!(matches!(reg.close(&a), Err(ScalError::NotFound { .. })));
    }

    #[test]
    fn test_interceptor_lifecycle() {
        let reg = InstanceRegistry::new();
        let builtin: Arc<dyn ScalOps> = Arc::new(BuiltinOps);
        let counting = Arc::new(CountingInterceptor::default());
        let interceptor: Arc<dyn Interceptor> = counting.clone();

        let a = reg.open(5, Some(&interceptor), &builtin, create(5, intercepting())).unwrap();
        let b = reg.open(6, Some(&interceptor), &builtin, create(6, intercepting())).unwrap();
        assert_eq!(counting.installs.load(Ordering::SeqCst), 1);
        assert!(reg.ops().is_some());

        reg.close(&a).unwrap();
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 0);
        reg.close(&b).unwrap();
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 1);
        assert!(reg.ops().is_none());
    }

    #[test]
    fn test_interception_disabled_by_config() {
        let reg = InstanceRegistry::new();
        let builtin: Arc<dyn ScalOps> = Arc::new(BuiltinOps);
        let counting = Arc::new(CountingInterceptor::default());
        let interceptor: Arc<dyn Interceptor> = counting.clone();
        let a = reg
            .open(5, Some(&interceptor), &builtin, create(5, RuntimeConfig::default()))
            .unwrap();
        assert_eq!(counting.installs.load(Ordering::SeqCst), 0);
        assert!(reg.ops().is_none());
        reg.close(&a).unwrap();
        assert_eq!(counting.finishes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_create_registers_nothing() {
        let reg = InstanceRegistry::new();
        let builtin: Arc<dyn ScalOps> = Arc::new(BuiltinOps);
        let err = reg
            .open(5, None, &builtin, || Err(ScalError::InvalidConfig("broken".into())))
            .unwrap_err();
        assert!(matches!(err, ScalError::InvalidConfig(_)));
        assert!(reg.is_empty());
    }
}
