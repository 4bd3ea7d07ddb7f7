//! Local and master-assisted limiters, and the proxy in front of them.
//!
//! A [`Group`] queues callers of one I/O group: whoever needs bandwidth
//! waits until the group's reserve covers its request, topping the reserve
//! up from the underlying [`Limiter`] no more often than the configured
//! delta allows. The [`LimiterProxy`] classifies callers into groups and
//! survives reconfiguration: removed groups wake their waiters with an
//! error, new groups start fresh.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::common::clock::Clock;
use crate::error::{FsError, Result};
use crate::master::messages::{MasterRequest, MasterResponse};
use crate::master::Master;

use super::database::{IoLimitsDatabase, LimitsMap};
use super::group::GroupClassifier;
use super::UNCLASSIFIED;

/// Something that can grant bandwidth: the local database or the master.
pub trait Limiter: Send + Sync {
    /// Request `size` bytes for `group`; the grant may be any amount up to
    /// `size`, including zero.
    fn request<'a>(
        &'a self,
        group: &'a str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;
}

/// Limits enforced entirely inside this mount.
pub struct MountLimiter {
    database: Mutex<IoLimitsDatabase>,
    clock: Arc<dyn Clock>,
}

impl MountLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { database: Mutex::new(IoLimitsDatabase::new()), clock }
    }

    /// Load the local limits configuration; returns the valid group list
    /// for the proxy's reconfigure call.
    pub fn load_configuration(&self, limits: &LimitsMap, accumulate_ms: u32) -> Vec<String> {
        let mut database = self.database.lock();
        database.set_limits(self.clock.now(), limits, accumulate_ms);
        database.groups()
    }
}

impl Limiter for MountLimiter {
    fn request<'a>(
        &'a self,
        group: &'a str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move { self.database.lock().request(self.clock.now(), group, size) })
    }
}

/// Forwards grant requests to the global limiter in the master.
pub struct MasterLimiter {
    master: Arc<Master>,
    config_version: AtomicU32,
}

impl MasterLimiter {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master, config_version: AtomicU32::new(0) }
    }

    /// Called when the master pushes a new limits configuration. Returns
    /// what the proxy needs for its own reconfiguration.
    pub fn handle_config_push(
        &self,
        config_version: u32,
        period_us: u32,
        subsystem: String,
        groups: Vec<String>,
    ) -> (u32, String, Vec<String>) {
        self.config_version.store(config_version, Ordering::SeqCst);
        info!("received I/O limits configuration v{} from master", config_version);
        (period_us, subsystem, groups)
    }
}

impl Limiter for MasterLimiter {
    fn request<'a>(
        &'a self,
        group: &'a str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        Box::pin(async move {
            let config_version = self.config_version.load(Ordering::SeqCst);
            let response = self
                .master
                .request(MasterRequest::IoLimit {
                    config_version,
                    group: group.to_string(),
                    bytes: size,
                })
                .await;
            match response {
                Ok(MasterResponse::IoLimitGranted {
                    config_version: reply_version,
                    group: reply_group,
                    bytes,
                }) => {
                    if reply_version != config_version {
                        warn!(
                            "IOLIMIT answered for config v{} instead of v{}",
                            reply_version, config_version
                        );
                        return Ok(0);
                    }
                    if reply_group != group {
                        warn!("IOLIMIT answered for group {} instead of {}", reply_group, group);
                        return Ok(0);
                    }
                    Ok(bytes)
                }
                Ok(_) => Err(FsError::Protocol("unexpected iolimit reply".into())),
                Err(err) => {
                    warn!("IOLIMIT request failed: {}", err);
                    Ok(0)
                }
            }
        })
    }
}

struct GroupState {
    reserve: u64,
    dead: bool,
    outstanding: bool,
    last_request_end: Option<Instant>,
    last_successful: bool,
}

/// One I/O group's waiting room.
struct Group {
    id: String,
    clock: Arc<dyn Clock>,
    state: Mutex<GroupState>,
    notify: Notify,
}

impl Group {
    fn new(id: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            clock,
            state: Mutex::new(GroupState {
                reserve: 0,
                dead: false,
                outstanding: false,
                last_request_end: None,
                last_successful: true,
            }),
            notify: Notify::new(),
        }
    }

    /// Block cooperatively until `size` bytes are granted, the deadline
    /// passes, or the group is killed by a reconfiguration.
    ///
    /// The grant request itself runs as a detached task: a slow master
    /// cannot hold the waiter past its deadline, and a grant that arrives
    /// after the deadline lands in the group reserve for whoever waits
    /// next. The deadline is checked before the reserve, so the expired
    /// waiter itself always gets `Timeout`.
    async fn wait(
        self: Arc<Self>,
        limiter: Arc<dyn Limiter>,
        size: u64,
        deadline: Instant,
        delta: Duration,
    ) -> Result<()> {
        loop {
            let now = self.clock.now();
            let ask = {
                let mut state = self.state.lock();
                if state.dead {
                    return Err(FsError::Enoent);
                }
                if now >= deadline {
                    return Err(FsError::Timeout);
                }
                if state.reserve >= size {
                    state.reserve -= size;
                    return Ok(());
                }
                let may_ask = !state.outstanding
                    && (state.last_successful
                        || state
                            .last_request_end
                            .map_or(true, |end| now >= end + delta));
                if may_ask {
                    state.outstanding = true;
                    Some(size - state.reserve)
                } else {
                    None
                }
            };

            // register for grant notifications before the request can
            // complete, otherwise its wakeup is lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(needed) = ask {
                let group = Arc::clone(&self);
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let granted = limiter.request(&group.id, needed).await.unwrap_or(0);
                    let mut state = group.state.lock();
                    state.outstanding = false;
                    state.last_request_end = Some(group.clock.now());
                    state.last_successful = granted >= needed;
                    state.reserve += granted;
                    drop(state);
                    group.notify.notify_waiters();
                });
            }

            let wake_at = {
                let state = self.state.lock();
                match state.last_request_end {
                    Some(end) if !state.outstanding && !state.last_successful => {
                        std::cmp::min(end + delta, deadline)
                    }
                    _ => deadline,
                }
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = self.clock.sleep_until(wake_at) => {}
            }
        }
    }

    /// Wake every waiter with an error; the group is gone.
    fn die(&self) {
        self.state.lock().dead = true;
        self.notify.notify_waiters();
    }
}

struct ProxyState {
    groups: BTreeMap<String, Arc<Group>>,
    subsystem: String,
    delta: Duration,
    enabled: bool,
}

/// Classifies callers into groups and performs the required delays against
/// a local or remote limiter.
pub struct LimiterProxy {
    limiter: Arc<dyn Limiter>,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn GroupClassifier>,
    state: Mutex<ProxyState>,
}

impl LimiterProxy {
    pub fn new(
        limiter: Arc<dyn Limiter>,
        clock: Arc<dyn Clock>,
        classifier: Arc<dyn GroupClassifier>,
    ) -> Self {
        Self {
            limiter,
            clock,
            classifier,
            state: Mutex::new(ProxyState {
                groups: BTreeMap::new(),
                subsystem: String::new(),
                delta: Duration::from_millis(100),
                enabled: true,
            }),
        }
    }

    pub async fn wait_for_read(&self, pid: u32, size: u64, deadline: Instant) -> Result<()> {
        self.wait(pid, size, deadline).await
    }

    pub async fn wait_for_write(&self, pid: u32, size: u64, deadline: Instant) -> Result<()> {
        self.wait(pid, size, deadline).await
    }

    async fn wait(&self, pid: u32, size: u64, deadline: Instant) -> Result<()> {
        loop {
            let (group, delta) = {
                let state = self.state.lock();
                if !state.enabled {
                    return Ok(());
                }
                let group_id = self.classifier.classify(pid, &state.subsystem);
                let group = state
                    .groups
                    .get(&group_id)
                    .or_else(|| state.groups.get(UNCLASSIFIED))
                    .cloned();
                (group, state.delta)
            };
            let group = match group {
                Some(group) => group,
                None => return Err(FsError::Eperm),
            };
            match group.wait(Arc::clone(&self.limiter), size, deadline, delta).await {
                // the group disappeared in a reconfiguration; classify again
                Err(FsError::Enoent) => continue,
                other => return other,
            }
        }
    }

    /// Install a new group list. Groups missing from the list are killed
    /// (their waiters get `NotFound` and re-classify); changing the
    /// subsystem invalidates every existing group.
    pub fn reconfigure(&self, delta_us: u32, subsystem: &str, group_ids: Vec<String>) {
        let mut state = self.state.lock();
        let different_subsystem = state.subsystem != subsystem;

        let mut fresh: BTreeMap<String, Arc<Group>> = BTreeMap::new();
        for group_id in group_ids {
            match state.groups.get(&group_id) {
                Some(existing) if !different_subsystem => {
                    fresh.insert(group_id, Arc::clone(existing));
                }
                _ => {
                    let group =
                        Arc::new(Group::new(group_id.clone(), Arc::clone(&self.clock)));
                    fresh.insert(group_id, group);
                }
            }
        }
        // whatever is not carried over dies
        for (group_id, group) in state.groups.iter() {
            let replaced = different_subsystem || !fresh.contains_key(group_id);
            if replaced {
                group.die();
            }
        }

        state.groups = fresh;
        state.delta = Duration::from_micros(delta_us as u64);
        state.subsystem = subsystem.to_string();
        state.enabled = !state.subsystem.is_empty() || state.groups.contains_key(UNCLASSIFIED);
        info!(
            "I/O limits reconfigured: subsystem '{}', {} groups",
            state.subsystem,
            state.groups.len()
        );
    }
}
