//! Process-wide table of coordinating instances.
//!
//! Instances live in an arena of generation-tagged slots holding weak
//! references. `register` hands back a stable [`RegistrationHandle`];
//! entries whose owner was dropped or disposed are pruned lazily on the next
//! fan-out. The registry also owns the single remote listener of the process.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use rollback_common::{InstanceFailure, InstanceId, Signal, TransportError};

use crate::channel::{DatagramBroadcast, ListenerHandle, ListenerState, PointToPointChannel};
use crate::config::Transport;
use crate::instance::Coordinated;

/// Stable reference to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    index: usize,
    generation: u64,
}

struct Entry {
    id: InstanceId,
    instance: Weak<dyn Coordinated>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Outcome of fanning one signal out to every live instance
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub signal: Signal,
    pub applied: usize,
    pub failures: Vec<InstanceFailure>,
}

impl ApplyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied + self.failures.len()
    }

    /// Number of instances reached, or the aggregated failures
    pub fn into_result(self) -> Result<usize, TransportError> {
        if self.failures.is_empty() {
            Ok(self.applied)
        } else {
            Err(TransportError::InstancesFailed {
                signal: self.signal,
                total: self.total(),
                failures: self.failures,
            })
        }
    }
}

/// Fan-out table shared by every instance in the process
#[derive(Default)]
pub struct CoordinationRegistry {
    slots: RwLock<Vec<Slot>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl CoordinationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The registry shared by every library instance in this process
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CoordinationRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(CoordinationRegistry::new).clone()
    }

    /// Add an instance. Registering the same instance again returns the
    /// existing handle instead of creating a second fan-out target.
    pub fn register<T: Coordinated + 'static>(&self, instance: &Arc<T>) -> RegistrationHandle {
        let id = instance.id();
        let weak: Weak<dyn Coordinated> = Arc::downgrade(instance) as Weak<dyn Coordinated>;
        let mut slots = self.slots.write();

        if let Some(handle) = find(&slots, id) {
            return handle;
        }

        let entry = Entry { id, instance: weak };
        let index = match slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => {
                slots[index].entry = Some(entry);
                index
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                slots.len() - 1
            }
        };

        tracing::debug!(instance = %id, slot = index, "Instance registered");
        RegistrationHandle {
            index,
            generation: slots[index].generation,
        }
    }

    /// Remove an instance. Stale handles are ignored.
    pub fn unregister(&self, handle: RegistrationHandle) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation && slot.entry.is_some() => {
                if let Some(entry) = slot.entry.take() {
                    tracing::debug!(instance = %entry.id, slot = handle.index, "Instance unregistered");
                }
                slot.generation += 1;
                true
            }
            _ => false,
        }
    }

    /// Number of live, non-disposed instances
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|entry| entry.instance.upgrade().is_some_and(|i| !i.is_disposed()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a signal to every live instance.
    ///
    /// A failing instance does not stop the fan-out; failures are collected
    /// in the report.
    pub fn apply_signal(&self, signal: Signal) -> ApplyReport {
        let instances = self.live_instances();
        tracing::debug!(signal = %signal, instances = instances.len(), "Applying signal");

        let mut report = ApplyReport {
            signal,
            applied: 0,
            failures: Vec::new(),
        };

        for instance in instances {
            match instance.apply(signal) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    let label = instance.label();
                    tracing::warn!(
                        instance = %instance.id(),
                        label = %label,
                        signal = %signal,
                        error = %e,
                        "Instance failed to apply signal"
                    );
                    report.failures.push(InstanceFailure {
                        instance: instance.id(),
                        label,
                        signal,
                        message: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Snapshot of live instances, pruning dead and disposed entries
    fn live_instances(&self) -> Vec<Arc<dyn Coordinated>> {
        let mut slots = self.slots.write();
        let mut live = Vec::new();

        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_ref() else {
                continue;
            };
            match entry.instance.upgrade() {
                Some(instance) if !instance.is_disposed() => live.push(instance),
                _ => {
                    tracing::debug!(instance = %entry.id, slot = index, "Pruning dropped instance");
                    slot.entry = None;
                    slot.generation += 1;
                }
            }
        }

        live
    }

    /// Start the configured remote listener unless this process already has one.
    ///
    /// Returns the listener address, or `None` for local-only coordination. A
    /// listener that died stays dead: it is reported through
    /// [`listener_state`](Self::listener_state), not restarted.
    pub fn ensure_listener(
        self: &Arc<Self>,
        transport: &Transport,
    ) -> Result<Option<SocketAddr>, TransportError> {
        let mut listener = self.listener.lock();
        if let Some(handle) = listener.as_ref() {
            return Ok(Some(handle.local_addr()));
        }

        let handle = match transport {
            Transport::Local => return Ok(None),
            Transport::Multicast(target) => DatagramBroadcast::start_listening(*target, self)?,
            Transport::PointToPoint(target) => {
                PointToPointChannel::start_listening(target.port, self)?
            }
        };

        let addr = handle.local_addr();
        *listener = Some(handle);
        Ok(Some(addr))
    }

    pub fn listener_state(&self) -> Option<ListenerState> {
        self.listener.lock().as_ref().map(ListenerHandle::state)
    }

    /// Stop and forget the remote listener, if any
    pub fn stop_listener(&self) {
        let handle = self.listener.lock().take();
        if let Some(mut handle) = handle {
            handle.stop();
        }
    }
}

fn find(slots: &[Slot], id: InstanceId) -> Option<RegistrationHandle> {
    slots.iter().enumerate().find_map(|(index, slot)| {
        slot.entry
            .as_ref()
            .filter(|entry| entry.id == id && entry.instance.strong_count() > 0)
            .map(|_| RegistrationHandle {
                index,
                generation: slot.generation,
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;
    use crate::instance::ManagedConnection;
    use crate::testing::{Call, StubConnection, StubProbe};

    fn instance_with_stub(label: &str) -> (Arc<InstanceState<StubConnection>>, StubProbe) {
        let probe = StubProbe::new();
        let instance = InstanceState::new(label);
        let managed = ManagedConnection::new(StubConnection::new(&probe), "ISOLATE");
        instance.install(Arc::new(managed));
        (instance, probe)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = CoordinationRegistry::new();
        let (a, _) = instance_with_stub("a");

        let first = registry.register(&a);
        let second = registry.register(&a);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_and_stale_handle() {
        let registry = CoordinationRegistry::new();
        let (a, _) = instance_with_stub("a");
        let (b, _) = instance_with_stub("b");

        let handle = registry.register(&a);
        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));

        // slot is reused with a new generation
        let reused = registry.register(&b);
        assert_ne!(reused, handle);
        assert!(!registry.unregister(handle));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dropped_and_disposed_instances_are_pruned() {
        let registry = CoordinationRegistry::new();
        let (a, _) = instance_with_stub("a");
        let (b, _) = instance_with_stub("b");
        let (c, probe_c) = instance_with_stub("c");
        registry.register(&a);
        registry.register(&b);
        registry.register(&c);

        drop(a);
        b.dispose();

        let report = registry.apply_signal(Signal::DisableTransactions);
        assert_eq!(report.applied, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(probe_c.calls(), vec![Call::SetAutoCommit(false)]);
    }

    #[test]
    fn test_three_instance_scenario() {
        let registry = CoordinationRegistry::new();
        let instances: Vec<_> = ["A", "B", "C"].iter().map(|l| instance_with_stub(l)).collect();
        for (instance, _) in &instances {
            registry.register(instance);
        }

        let report = registry.apply_signal(Signal::DisableTransactions);
        assert!(report.is_ok());
        assert_eq!(report.applied, 3);
        for (instance, probe) in &instances {
            assert!(!instance.transactions_enabled());
            assert_eq!(probe.count(&Call::SetAutoCommit(false)), 1);
        }

        registry.apply_signal(Signal::EnableTransactions);
        for (instance, _) in &instances {
            assert!(instance.transactions_enabled());
        }

        let report = registry.apply_signal(Signal::RollbackAll);
        assert_eq!(report.applied, 3);
        for (instance, probe) in &instances {
            assert_eq!(probe.count(&Call::Rollback), 1);
            assert!(!instance.transactions_enabled());
        }
    }

    #[test]
    fn test_failing_instance_does_not_stop_fan_out() {
        let registry = CoordinationRegistry::new();
        let (a, probe_a) = instance_with_stub("a");
        let (b, probe_b) = instance_with_stub("b");
        let (c, probe_c) = instance_with_stub("c");
        registry.register(&a);
        registry.register(&b);
        registry.register(&c);
        probe_a.fail_rollback(true);

        let report = registry.apply_signal(Signal::RollbackAll);

        assert_eq!(report.applied, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, "a");
        assert_eq!(probe_b.count(&Call::Rollback), 1);
        assert_eq!(probe_c.count(&Call::Rollback), 1);
        assert!(!a.transactions_enabled());

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, TransportError::InstancesFailed { total: 3, .. }));
    }

    #[test]
    fn test_ensure_listener_local_is_noop() {
        let registry = CoordinationRegistry::new();
        assert_eq!(registry.ensure_listener(&Transport::Local).unwrap(), None);
        assert_eq!(registry.listener_state(), None);
    }
}
