//! Resource management

use crate::error::PortalError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// [crate::resource_manager::ResourceManager] bounds what concurrent builds may consume.
/// Resource management is performed using a Tokio Semaphore for each type of resource.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for remote (HTTP and S3) connections.
    remote_connections: Option<Semaphore>,

    /// Optional semaphore for memory (bytes).
    memory: Option<Semaphore>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,

    /// Optional semaphore for CPU-bound tasks.
    tasks: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(
        remote_connection_limit: Option<usize>,
        memory_limit: Option<usize>,
        task_limit: Option<usize>,
    ) -> Self {
        Self {
            remote_connections: remote_connection_limit.map(Semaphore::new),
            memory: memory_limit.map(Semaphore::new),
            total_memory: memory_limit,
            tasks: task_limit.map(Semaphore::new),
        }
    }

    /// Acquire a remote connection resource.
    pub async fn remote_connection(&self) -> Result<Option<SemaphorePermit>, PortalError> {
        optional_acquire(&self.remote_connections, 1).await
    }

    /// Acquire memory resource.
    ///
    /// Fails immediately when `bytes` exceeds the whole pool, since waiting could never succeed.
    pub async fn memory(&self, bytes: usize) -> Result<Option<SemaphorePermit>, PortalError> {
        if let Some(total_memory) = self.total_memory {
            if bytes > total_memory {
                return Err(PortalError::InsufficientMemory {
                    requested: bytes,
                    total: total_memory,
                });
            };
        };
        optional_acquire(&self.memory, bytes).await
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<SemaphorePermit>, PortalError> {
        optional_acquire(&self.tasks, 1).await
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
    n: usize,
) -> Result<Option<SemaphorePermit>, PortalError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.acquire_many(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::TryAcquireError;

    #[tokio::test]
    async fn no_resource_management() {
        let rm = ResourceManager::new(None, None, None);
        assert!(rm.remote_connections.is_none());
        assert!(rm.memory.is_none());
        assert!(rm.tasks.is_none());
        let c = rm.remote_connection().await.unwrap();
        let m = rm.memory(1 << 40).await.unwrap();
        let t = rm.task().await.unwrap();
        assert!(c.is_none());
        assert!(m.is_none());
        assert!(t.is_none());
    }

    #[tokio::test]
    async fn full_resource_management() {
        let rm = ResourceManager::new(Some(1), Some(1), Some(1));
        let c = rm.remote_connection().await.unwrap();
        let m = rm.memory(1).await.unwrap();
        let t = rm.task().await.unwrap();
        assert!(c.is_some());
        assert!(m.is_some());
        assert!(t.is_some());
        // Check that there are no more resources (without blocking).
        assert_eq!(
            rm.remote_connections.as_ref().unwrap().try_acquire().err(),
            Some(TryAcquireError::NoPermits)
        );
        assert_eq!(
            rm.memory.as_ref().unwrap().try_acquire().err(),
            Some(TryAcquireError::NoPermits)
        );
        assert_eq!(
            rm.tasks.as_ref().unwrap().try_acquire().err(),
            Some(TryAcquireError::NoPermits)
        );
        drop(c);
        assert!(rm.remote_connections.as_ref().unwrap().try_acquire().is_ok());
    }

    #[tokio::test]
    async fn memory_request_larger_than_pool() {
        let rm = ResourceManager::new(None, Some(16), None);
        match rm.memory(17).await.unwrap_err() {
            PortalError::InsufficientMemory { requested, total } => {
                assert_eq!((17, 16), (requested, total))
            }
            err => panic!("unexpected error {}", err),
        }
    }
}
