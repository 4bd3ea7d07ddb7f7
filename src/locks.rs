//! POSIX range locks and flocks against the master.
//!
//! Both families share one request-id counter. A lock that cannot be
//! granted immediately is queued by the master; the grant arrives
//! asynchronously and is matched back to the waiter by request id. Waiting
//! is cooperative and cancellable: on cancellation an `INTERRUPT` message
//! tells the master to drop the queued request, and the waiter completes
//! with `EINTR`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{FsError, Result};
use crate::master::messages::{LockKind, LockRange, MasterRequest, MasterResponse};
use crate::master::Master;
use crate::protocol::Inode;

pub use crate::master::messages::{LockKind as Kind, LockRange as Range};

pub struct LockCoordinator {
    master: Arc<Master>,
    next_req_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<()>>>>,
}

impl LockCoordinator {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master, next_req_id: AtomicU32::new(1), pending: Mutex::new(HashMap::new()) }
    }

    /// Probe for a conflicting lock (`F_GETLK`).
    pub async fn get_lock(
        &self,
        inode: Inode,
        owner: u64,
        kind: LockKind,
        range: LockRange,
    ) -> Result<Option<(LockKind, LockRange, u64)>> {
        match self.master.request(MasterRequest::GetLk { inode, owner, kind, range }).await? {
            MasterResponse::Done => Ok(None),
            MasterResponse::LockStatus { kind, range, owner } => Ok(Some((kind, range, owner))),
            _ => Err(FsError::Protocol("unexpected getlk reply".into())),
        }
    }

    /// Acquire or release a POSIX range lock. With a deadline, a queued
    /// wait is interrupted when the deadline passes.
    pub async fn set_lock(
        &self,
        inode: Inode,
        owner: u64,
        kind: LockKind,
        range: LockRange,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let req_id = self.allocate_req_id();
        let request = MasterRequest::SetLk { inode, owner, req_id, kind, range };
        self.lock_request(inode, owner, req_id, request, deadline).await
    }

    /// Acquire or release a whole-file flock.
    pub async fn flock(
        &self,
        inode: Inode,
        owner: u64,
        kind: LockKind,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let req_id = self.allocate_req_id();
        let request = MasterRequest::Flock { inode, owner, req_id, kind };
        self.lock_request(inode, owner, req_id, request, deadline).await
    }

    /// Release everything the owner holds on the inode. Fire and forget;
    /// must be the last lock operation before close.
    pub async fn release_on_close(&self, inode: Inode, owner: u64) {
        let req_id = self.allocate_req_id();
        let result = self
            .master
            .request(MasterRequest::Flock { inode, owner, req_id, kind: LockKind::Unlock })
            .await;
        if let Err(err) = result {
            warn!("releasing locks of inode {} on close failed: {}", inode, err);
        }
    }

    /// Deliver an asynchronous lock grant (or error) pushed by the master.
    pub fn complete(&self, req_id: u32, result: Result<()>) {
        let waiter = self.pending.lock().remove(&req_id);
        match waiter {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!("lock grant for unknown request {}", req_id),
        }
    }

    async fn lock_request(
        &self,
        inode: Inode,
        owner: u64,
        req_id: u32,
        request: MasterRequest,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(req_id, sender);

        let response = match self.master.request(request).await {
            Ok(response) => response,
            Err(err) => {
                self.pending.lock().remove(&req_id);
                return Err(err);
            }
        };

        match response {
            MasterResponse::Done => {
                self.pending.lock().remove(&req_id);
                Ok(())
            }
            MasterResponse::LockQueued => self.wait_queued(inode, owner, req_id, receiver, deadline).await,
            _ => {
                self.pending.lock().remove(&req_id);
                Err(FsError::Protocol("unexpected lock reply".into()))
            }
        }
    }

    async fn wait_queued(
        &self,
        inode: Inode,
        owner: u64,
        req_id: u32,
        receiver: oneshot::Receiver<Result<()>>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let grant = match deadline {
            None => receiver.await,
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), receiver).await {
                    Ok(grant) => grant,
                    Err(_elapsed) => {
                        // tell the master to forget the queued request
                        self.pending.lock().remove(&req_id);
                        let interrupt = self
                            .master
                            .request(MasterRequest::LockInterrupt { inode, owner, req_id })
                            .await;
                        if let Err(err) = interrupt {
                            warn!("interrupting lock request {} failed: {}", req_id, err);
                        }
                        return Err(FsError::Eintr);
                    }
                }
            }
        };
        match grant {
            Ok(result) => result,
            Err(_closed) => Err(FsError::Eintr),
        }
    }

    fn allocate_req_id(&self) -> u32 {
        self.next_req_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::MasterTransport;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    #[derive(Default)]
    struct QueueingMaster {
        interrupts: Mutex<Vec<u32>>,
        queue_everything: bool,
    }

    impl MasterTransport for QueueingMaster {
        fn request<'a>(
            &'a self,
            request: MasterRequest,
        ) -> Pin<Box<dyn Future<Output = Result<MasterResponse>> + Send + 'a>> {
            Box::pin(async move {
                match request {
                    MasterRequest::SetLk { kind: LockKind::Unlock, .. }
                    | MasterRequest::Flock { kind: LockKind::Unlock, .. } => {
                        Ok(MasterResponse::Done)
                    }
                    MasterRequest::SetLk { .. } | MasterRequest::Flock { .. } => {
                        if self.queue_everything {
                            Ok(MasterResponse::LockQueued)
                        } else {
                            Ok(MasterResponse::Done)
                        }
                    }
                    MasterRequest::LockInterrupt { req_id, .. } => {
                        self.interrupts.lock().push(req_id);
                        Ok(MasterResponse::Done)
                    }
                    _ => Err(FsError::Protocol("unexpected".into())),
                }
            })
        }
    }

    fn coordinator(queue: bool) -> (Arc<LockCoordinator>, Arc<QueueingMaster>) {
        let transport =
            Arc::new(QueueingMaster { interrupts: Mutex::new(vec![]), queue_everything: queue });
        let master = Arc::new(Master::new(transport.clone()));
        (Arc::new(LockCoordinator::new(master)), transport)
    }

    fn whole_file() -> LockRange {
        LockRange { start: 0, end: u64::MAX }
    }

    #[tokio::test]
    async fn immediate_grant() {
        let (locks, _) = coordinator(false);
        locks.set_lock(5, 77, LockKind::Exclusive, whole_file(), None).await.unwrap();
    }

    #[tokio::test]
    async fn queued_grant_arrives_asynchronously() {
        let (locks, _) = coordinator(true);
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks.flock(5, 77, LockKind::Exclusive, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the request id allocated for the flock was 1
        locks.complete(1, Ok(()));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deadline_sends_interrupt_and_returns_eintr() {
        let (locks, transport) = coordinator(true);
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = locks
            .set_lock(5, 77, LockKind::Exclusive, whole_file(), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Eintr));
        assert_eq!(transport.interrupts.lock().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn request_ids_increase_monotonically() {
        let (locks, _) = coordinator(false);
        let first = locks.allocate_req_id();
        let second = locks.allocate_req_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn queued_grant_can_deliver_an_error() {
        let (locks, _) = coordinator(true);
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.flock(5, 77, LockKind::Shared, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.complete(1, Err(FsError::Eintr));
        assert!(matches!(waiter.await.unwrap(), Err(FsError::Eintr)));
    }
}
