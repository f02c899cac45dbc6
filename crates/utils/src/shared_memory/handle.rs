use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use anyhow::Result;
use shared_memory::Shmem;
use shared_memory::ShmemConf;
use shared_memory::ShmemError;
use tracing::info;
use tracing::warn;

use super::SnapshotRegion;

/// Safely access the snapshot region, automatically handling the segment's
/// lifecycle.
pub struct SharedMemoryHandle {
    shmem: RefCell<Shmem>,
    ptr: *mut SnapshotRegion,
    identifier: String,
}

impl SharedMemoryHandle {
    /// Opens an existing shared memory segment.
    pub fn open(identifier: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(SnapshotRegion::size_bytes())
            .os_id(identifier)
            .open()
            .context("Failed to open shared memory")?;

        let ptr = shmem.as_ptr() as *mut SnapshotRegion;

        Ok(Self {
            shmem: RefCell::new(shmem),
            ptr,
            identifier: identifier.to_string(),
        })
    }

    /// Creates a new shared memory segment and initializes the region.
    pub fn create(identifier: &str) -> Result<Self> {
        let old_umask = unsafe { libc::umask(0) };

        let shmem = match ShmemConf::new()
            .size(SnapshotRegion::size_bytes())
            .os_id(identifier)
            .create()
        {
            Ok(shmem) => shmem,
            Err(ShmemError::MappingIdExists) | Err(ShmemError::LinkExists) => {
                // If it already exists, try to open it.
                ShmemConf::new()
                    .size(SnapshotRegion::size_bytes())
                    .os_id(identifier)
                    .open()
                    .context("Failed to open existing shared memory")?
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to create shared memory: {}", e)),
        };

        unsafe {
            libc::umask(old_umask);
        }

        // Consumers map the region read-only; make the segment readable for
        // them.
        let segment_path = format!("/dev/shm/{identifier}");
        if let Ok(metadata) = fs::metadata(&segment_path) {
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o644);
            if let Err(e) = fs::set_permissions(&segment_path, permissions) {
                warn!(identifier = %identifier, "failed to relax segment permissions: {e}");
            }
        }

        let ptr = shmem.as_ptr() as *mut SnapshotRegion;

        // Initialize the shared region (zero counters, empty identities).
        unsafe {
            SnapshotRegion::init_at(ptr);
        }

        info!(
            identifier = %identifier,
            size_bytes = SnapshotRegion::size_bytes(),
            "Created shared memory segment"
        );

        Ok(Self {
            shmem: RefCell::new(shmem),
            ptr,
            identifier: identifier.to_string(),
        })
    }

    /// Gets a pointer to the region.
    pub fn get_ptr(&self) -> *mut SnapshotRegion {
        self.ptr
    }

    pub fn set_owner(&self, is_owner: bool) {
        self.shmem.borrow_mut().set_owner(is_owner);
    }

    /// Gets a reference to the region.
    pub fn get_state(&self) -> &SnapshotRegion {
        unsafe { &*self.ptr }
    }

    /// Gets the shared memory identifier.
    pub fn get_identifier(&self) -> &str {
        &self.identifier
    }
}

// Implement Send and Sync because SnapshotRegion is only mutated through
// atomic operations.
unsafe impl Send for SharedMemoryHandle {}
unsafe impl Sync for SharedMemoryHandle {}

impl Drop for SharedMemoryHandle {
    fn drop(&mut self) {
        if !self.shmem.borrow().is_owner() {
            return;
        }

        let enrolled = self.get_state().live_count();
        if enrolled > 0 {
            info!(
                identifier = %self.identifier,
                enrolled,
                "process groups still enrolled, preserving shared memory"
            );
            // Don't clean up - consumers are still working off the region
            self.shmem.borrow_mut().set_owner(false);
        } else {
            info!(
                identifier = %self.identifier,
                "no process groups enrolled, allowing cleanup"
            );
            self.shmem.borrow_mut().set_owner(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process;

    use super::*;
    use crate::shared_memory::SlotView;

    #[test]
    fn create_then_open_share_one_region() {
        let identifier = format!("snapshot_handle_test_{}", process::id());

        let producer =
            SharedMemoryHandle::create(&identifier).expect("should create shared memory");
        assert_eq!(producer.get_state().live_count(), 0);

        let consumer = SharedMemoryHandle::open(&identifier).expect("should open shared memory");

        let view = SlotView {
            pgid: 42,
            jobid: 3,
            worker_num: 1,
            cycles: 10,
            instructions: 20,
        };
        producer.get_state().slot(0).publish(&view);
        producer.get_state().set_active(0);

        assert_eq!(consumer.get_state().slot(0).read(), view);
        assert!(consumer.get_state().is_active(0));
    }

    #[test]
    fn open_missing_segment_fails() {
        assert!(SharedMemoryHandle::open("snapshot_handle_missing").is_err());
    }

    #[test]
    fn segment_preserved_while_groups_enrolled() {
        let identifier = format!("snapshot_preserved_{}", process::id());

        let handle = SharedMemoryHandle::create(&identifier).expect("should create shared memory");
        assert!(handle.shmem.borrow().is_owner());
        assert_eq!(handle.get_state().live_count(), 0);

        // Simulate an enrolled process group still using the region.
        handle.get_state().set_active(0);
        handle.get_state().inc_count();

        drop(handle);

        // The segment survived the owner's drop.
        let reopened = SharedMemoryHandle::open(&identifier);
        assert!(reopened.is_ok());

        std::fs::remove_file(format!("/dev/shm/{identifier}")).unwrap();
    }

    #[test]
    fn segment_cleaned_up_when_empty() {
        let identifier = format!("snapshot_cleanup_{}", process::id());

        let handle = SharedMemoryHandle::create(&identifier).expect("should create shared memory");
        assert!(handle.shmem.borrow().is_owner());
        assert_eq!(handle.get_state().live_count(), 0);

        drop(handle);

        assert!(SharedMemoryHandle::open(&identifier).is_err());
    }
}
