use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::DeviceControlResult;

/// Starts and stops the shared server process.
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn start(&self) -> DeviceControlResult<()>;
    async fn stop(&self) -> DeviceControlResult<()>;
}

/// Reference-counted owner of the shared server. The server is started by
/// the first lease and stopped when the last lease is released.
pub struct AdbServerSupervisor {
    control: Arc<dyn ServerControl>,
    leases: Mutex<usize>,
}

impl AdbServerSupervisor {
    pub fn new(control: Arc<dyn ServerControl>) -> Arc<Self> {
        Arc::new(Self {
            control,
            leases: Mutex::new(0),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> DeviceControlResult<ServerLease> {
        let mut leases = self.leases.lock().await;
        if *leases == 0 {
            debug!("starting adb server");
            self.control.start().await?;
        }
        *leases += 1;
        Ok(ServerLease {
            supervisor: Some(Arc::clone(self)),
        })
    }

    pub async fn active_leases(&self) -> usize {
        *self.leases.lock().await
    }

    async fn release(&self) {
        let mut leases = self.leases.lock().await;
        *leases = leases.saturating_sub(1);
        if *leases == 0 {
            debug!("stopping adb server");
            if let Err(e) = self.control.stop().await {
                warn!(error = %e, "failed to stop adb server cleanly");
            }
        }
    }
}

impl std::fmt::Debug for AdbServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbServerSupervisor").finish_non_exhaustive()
    }
}

/// A hold on the shared server. Dropping it releases in the background.
#[derive(Debug)]
pub struct ServerLease {
    supervisor: Option<Arc<AdbServerSupervisor>>,
}

impl ServerLease {
    pub async fn release(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.release().await;
        }
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { supervisor.release().await });
            }
        }
    }
}

/// One async mutex per device address. An address's entry lives only while
/// some caller holds or awaits its lock.
#[derive(Debug, Default)]
pub struct AddressLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn lock(self: &Arc<Self>, address: &str) -> AddressGuard {
        let lock = self
            .entries()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        AddressGuard {
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(self),
            address: address.to_string(),
        }
    }

    /// Number of addresses currently tracked.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, address: &str) {
        let mut entries = self.entries();
        if entries
            .get(address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            entries.remove(address);
            debug!(address, "address lock released");
        }
    }
}

/// Exclusive hold on one address. The address's entry is dropped with the
/// last holder.
#[derive(Debug)]
pub struct AddressGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<AddressLocks>,
    address: String,
}

impl Drop for AddressGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct CountingServer {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ServerControl for CountingServer {
        async fn start(&self) -> DeviceControlResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> DeviceControlResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn server_runs_while_any_lease_is_held() {
        let server = Arc::new(CountingServer::default());
        let supervisor = AdbServerSupervisor::new(server.clone());

        let a = supervisor.acquire().await.unwrap();
        let b = supervisor.acquire().await.unwrap();
        assert_eq!(server.starts.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active_leases().await, 2);

        a.release().await;
        assert_eq!(server.stops.load(Ordering::SeqCst), 0);
        b.release().await;
        assert_eq!(server.stops.load(Ordering::SeqCst), 1);

        let _c = supervisor.acquire().await.unwrap();
        assert_eq!(server.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_lease_is_released() {
        let server = Arc::new(CountingServer::default());
        let supervisor = AdbServerSupervisor::new(server.clone());
        drop(supervisor.acquire().await.unwrap());

        for _ in 0..50 {
            if supervisor.active_leases().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(supervisor.active_leases().await, 0);
        assert_eq!(server.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_holder_per_address() {
        let locks = Arc::new(AddressLocks::new());
        let guard = locks.lock("10.0.0.1:5555").await;

        let other = locks.lock("10.0.0.2:5555").await;
        drop(other);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("10.0.0.1:5555").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn released_addresses_are_forgotten() {
        let locks = Arc::new(AddressLocks::new());
        for octet in 1..=20 {
            let guard = locks.lock(&format!("10.0.0.{octet}:5555")).await;
            assert_eq!(locks.len(), 1);
            drop(guard);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_remains() {
        let locks = Arc::new(AddressLocks::new());
        let guard = locks.lock("10.0.0.1:5555").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("10.0.0.1:5555").await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
