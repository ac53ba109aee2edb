// ── Per-interface state ──
//
// One `Interface` per configured backend connection. It owns that
// connection's caches, health monitor, and Request Client. Cache and
// entity mutations happen only in `apply`, which runs on the interface's
// apply task; everything else proposes updates through `submit`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hmgate_api::{
    CallbackEvent, DeviceDescription, LegacyClient, Paramset, ParamsetKind, PrimaryClient,
    RequestClient, Value,
};

use super::{CentralEvent, Shared};
use crate::command::CommandEnvelope;
use crate::config::{CacheConfig, HealthConfig, InterfaceConfig, RequestConfig, build_transport};
use crate::error::CoreError;
use crate::health::{ConnectionState, HealthMonitor, Transition};
use crate::materialize::{Materializer, is_event_parameter, refresh_state, sync_device};
use crate::model::{Device, EntityId, Validity, ValueSource, address};
use crate::store::description_cache::PersistedParamset;
use crate::store::{DescriptionCache, InterfaceSnapshot, LoadOutcome, ValueCache, ValueKey};

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Channel-0 parameter flagging a device as out of radio range.
const UNREACH: &str = "UNREACH";
/// Channel-0 parameter flagging configuration not yet transferred.
const CONFIG_PENDING: &str = "CONFIG_PENDING";

// ── Proposed updates ─────────────────────────────────────────────────

/// A change proposed to the apply task.
#[derive(Debug)]
pub(crate) enum Update {
    Value {
        channel_address: String,
        parameter: String,
        value: Value,
        source: ValueSource,
        at: DateTime<Utc>,
    },
    Paramset {
        address: String,
        values: Paramset,
        source: ValueSource,
        at: DateTime<Utc>,
    },
    /// Fresh descriptions for whole devices; replaces what was cached.
    Described {
        descriptions: Vec<DeviceDescription>,
        paramsets: Vec<PersistedParamset>,
    },
    Deleted {
        address: String,
    },
    /// Connection state changed; re-derive entity uncertainty.
    Availability,
    /// Rules or schemas changed; rebuild entities.
    Rematerialize,
}

pub(crate) struct Proposal {
    pub update: Update,
    pub ack: Option<oneshot::Sender<()>>,
}

// ── Interface ────────────────────────────────────────────────────────

pub(crate) struct Interface {
    pub config: InterfaceConfig,
    shared: Arc<Shared>,
    request: RequestConfig,
    pub descriptions: DescriptionCache,
    pub values: ValueCache,
    devices: DashMap<String, Device>,
    client: RwLock<Option<Arc<RequestClient>>>,
    state: watch::Sender<ConnectionState>,
    health: Mutex<HealthMonitor>,
    callback_url: OnceLock<String>,
    /// Cancels in-flight requests and their retry loops.
    request_cancel: CancellationToken,
    apply_tx: mpsc::UnboundedSender<Proposal>,
    apply_rx: Mutex<Option<mpsc::UnboundedReceiver<Proposal>>>,
    command_tx: mpsc::Sender<CommandEnvelope>,
    command_rx: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
}

impl Interface {
    pub(crate) fn new(
        config: InterfaceConfig,
        shared: Arc<Shared>,
        cache: &CacheConfig,
        health: HealthConfig,
        request: RequestConfig,
        request_cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        Self {
            config,
            shared,
            request,
            descriptions: DescriptionCache::new(),
            values: ValueCache::new(cache.enabled),
            devices: DashMap::new(),
            client: RwLock::new(None),
            state,
            health: Mutex::new(HealthMonitor::new(health, Instant::now())),
            callback_url: OnceLock::new(),
            request_cancel,
            apply_tx,
            apply_rx: Mutex::new(Some(apply_rx)),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.config.interface_id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_callback_url(&self, url: String) {
        if self.callback_url.set(url).is_err() {
            debug!(interface_id = self.id(), "callback url already set");
        }
    }

    pub(crate) async fn take_apply_rx(&self) -> Option<mpsc::UnboundedReceiver<Proposal>> {
        self.apply_rx.lock().await.take()
    }

    pub(crate) async fn take_command_rx(&self) -> Option<mpsc::Receiver<CommandEnvelope>> {
        self.command_rx.lock().await.take()
    }

    pub(crate) fn command_sender(&self) -> mpsc::Sender<CommandEnvelope> {
        self.command_tx.clone()
    }

    pub(crate) fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|d| d.clone()).collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    pub(crate) fn device(&self, device_address: &str) -> Option<Device> {
        self.devices.get(device_address).map(|d| d.clone())
    }

    /// Entities of `device_address` may be trusted right now.
    fn available(&self, device_address: &str) -> bool {
        self.state().is_usable()
            && self
                .devices
                .get(device_address)
                .is_none_or(|d| d.reachable)
    }

    // ── Proposals ────────────────────────────────────────────────────

    pub(crate) fn submit(&self, update: Update) -> Result<(), CoreError> {
        self.apply_tx
            .send(Proposal { update, ack: None })
            .map_err(|_| CoreError::ShuttingDown)
    }

    /// Submit and wait until the apply task has processed the update.
    pub(crate) async fn submit_and_wait(&self, update: Update) -> Result<(), CoreError> {
        let (ack, done) = oneshot::channel();
        self.apply_tx
            .send(Proposal {
                update,
                ack: Some(ack),
            })
            .map_err(|_| CoreError::ShuttingDown)?;
        done.await.map_err(|_| CoreError::ShuttingDown)
    }

    // ── Clients ──────────────────────────────────────────────────────

    /// The Request Client for host calls. Fails fast while disconnected.
    pub(crate) async fn client(&self) -> Result<Arc<RequestClient>, CoreError> {
        if !self.state().is_usable() {
            return Err(CoreError::Unreachable {
                reason: format!("interface {} is disconnected", self.id()),
            });
        }
        self.raw_client().await
    }

    /// The Request Client regardless of connection state.
    async fn raw_client(&self) -> Result<Arc<RequestClient>, CoreError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::Unreachable {
                reason: format!("interface {} has not connected yet", self.id()),
            })
    }

    /// Negotiate the protocol once; later calls reuse the pinned client.
    async fn ensure_client(&self) -> Result<Arc<RequestClient>, CoreError> {
        if let Some(client) = self.client.read().await.clone() {
            return Ok(client);
        }

        let transport = build_transport(&self.config, &self.request);
        let primary = PrimaryClient::new(self.config.url.clone(), &transport)?;
        let legacy = self
            .config
            .legacy_url
            .as_ref()
            .map(|url| {
                LegacyClient::new(
                    url,
                    self.config.backend_interface.clone(),
                    self.config.credentials.clone(),
                    &transport,
                )
            })
            .transpose()?;

        let client = RequestClient::negotiate(
            primary,
            legacy,
            (&self.request).into(),
            self.request_cancel.clone(),
        )
        .await?;
        info!(interface_id = self.id(), protocol = %client.protocol(), "protocol negotiated");

        let client = Arc::new(client);
        *self.client.write().await = Some(Arc::clone(&client));
        Ok(client)
    }

    // ── Health accounting ────────────────────────────────────────────

    fn publish_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub(crate) async fn record_success(&self) {
        let (transition, state) = {
            let mut health = self.health.lock().await;
            (health.record_success(), health.state())
        };
        self.publish_state(state);
        if transition == Some(Transition::Available) {
            info!(interface_id = self.id(), "interface available");
            let _ = self.submit(Update::Availability);
            let _ = self.shared.event_tx.send(CentralEvent::InterfaceAvailable {
                interface_id: self.id().to_owned(),
            });
        }
    }

    pub(crate) async fn record_failure(&self, reason: &str) {
        let (transition, state, failures) = {
            let mut health = self.health.lock().await;
            let transition = health.record_failure();
            (transition, health.state(), health.consecutive_failures())
        };
        self.publish_state(state);
        debug!(interface_id = self.id(), failures, reason, "probe failure recorded");
        if transition == Some(Transition::Unavailable) {
            warn!(interface_id = self.id(), failures, reason, "interface unavailable");
            let _ = self.submit(Update::Availability);
            let _ = self.shared.event_tx.send(CentralEvent::InterfaceUnavailable {
                interface_id: self.id().to_owned(),
                reason: reason.to_owned(),
            });
        }
    }

    /// Feed a host-call outcome into health accounting.
    pub(crate) async fn note<T>(&self, result: &Result<T, CoreError>) {
        if let Err(e) = result {
            if e.is_connection_failure() {
                self.record_failure(&e.to_string()).await;
            }
        }
    }

    pub(crate) async fn next_health_delay(&self) -> std::time::Duration {
        self.health.lock().await.next_delay(Instant::now())
    }

    /// Lightweight liveness check.
    pub(crate) async fn probe(&self) -> Result<(), CoreError> {
        let client = self.raw_client().await?;
        if client.ping(&self.shared.central_id).await? {
            Ok(())
        } else {
            Err(CoreError::Unreachable {
                reason: "ping refused".into(),
            })
        }
    }

    // ── Connection setup ─────────────────────────────────────────────

    /// Negotiate (first time only), register the callback address, and
    /// bring the Description Cache in line with the backend's device list.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<(), CoreError> {
        let client = self.ensure_client().await?;
        let callback_url = self
            .callback_url
            .get()
            .cloned()
            .ok_or_else(|| CoreError::Internal("callback listener not bound".into()))?;
        client.init(&callback_url, self.id()).await?;
        debug!(interface_id = self.id(), %callback_url, "callback registered");
        self.sync_devices(&client).await
    }

    async fn sync_devices(&self, client: &RequestClient) -> Result<(), CoreError> {
        let listed = client.list_devices().await?;

        let listed_roots: BTreeMap<&str, &DeviceDescription> = listed
            .iter()
            .filter(|d| d.is_device())
            .map(|d| (d.address.as_str(), d))
            .collect();

        for known in self.descriptions.device_addresses() {
            if !listed_roots.contains_key(known.as_str()) {
                info!(interface_id = self.id(), device = %known, "device gone from backend");
                self.submit(Update::Deleted { address: known })?;
            }
        }

        // Devices cached with the same type and version are not re-described.
        let stale: BTreeSet<&str> = listed_roots
            .iter()
            .filter(|(addr, root)| {
                self.descriptions.device(addr).is_none_or(|cached| {
                    cached.device_type != root.device_type
                        || cached.version != root.version
                        || !self.descriptions.is_complete(addr)
                })
            })
            .map(|(addr, _)| *addr)
            .collect();

        let to_describe: Vec<DeviceDescription> = listed
            .iter()
            .filter(|d| stale.contains(address::device_address(&d.address)))
            .cloned()
            .collect();

        info!(
            interface_id = self.id(),
            devices = listed_roots.len(),
            describing = stale.len(),
            "device list synchronized"
        );

        if to_describe.is_empty() {
            return Ok(());
        }
        let paramsets = self.fetch_paramsets(client, &to_describe).await?;
        self.submit_and_wait(Update::Described {
            descriptions: to_describe,
            paramsets,
        })
        .await
    }

    async fn fetch_paramsets(
        &self,
        client: &RequestClient,
        descriptions: &[DeviceDescription],
    ) -> Result<Vec<PersistedParamset>, CoreError> {
        let mut paramsets = Vec::new();
        for description in descriptions {
            for kind in description.paramset_kinds() {
                if kind == ParamsetKind::Link {
                    continue;
                }
                match client.get_paramset_description(&description.address, kind).await {
                    Ok(parameters) => paramsets.push(PersistedParamset {
                        address: description.address.clone(),
                        kind,
                        parameters,
                    }),
                    Err(e) => {
                        let e = CoreError::from(e);
                        if e.is_connection_failure() {
                            return Err(e);
                        }
                        warn!(
                            interface_id = self.id(),
                            address = %description.address,
                            %kind,
                            error = %e,
                            "paramset description unavailable"
                        );
                    }
                }
            }
        }
        Ok(paramsets)
    }

    /// Re-read the VALUES paramset of every known channel (or of one
    /// device). Results go through the last-writer-wins apply path.
    pub(crate) async fn refresh_values(
        &self,
        device_address: Option<&str>,
    ) -> Result<(), CoreError> {
        let client = self.raw_client().await?;
        let devices = match device_address {
            Some(d) => vec![d.to_owned()],
            None => self.descriptions.device_addresses(),
        };

        let mut refreshed = 0usize;
        for device in devices {
            for channel in self.descriptions.channels_of(&device) {
                if !channel.paramset_kinds().contains(&ParamsetKind::Values) {
                    continue;
                }
                let at = Utc::now();
                match client.get_paramset(&channel.address, ParamsetKind::Values).await {
                    Ok(values) => {
                        refreshed += 1;
                        self.submit(Update::Paramset {
                            address: channel.address,
                            values,
                            source: ValueSource::Pull,
                            at,
                        })?;
                    }
                    Err(e) => {
                        let e = CoreError::from(e);
                        if e.is_connection_failure() || matches!(e, CoreError::ShuttingDown) {
                            return Err(e);
                        }
                        debug!(
                            interface_id = self.id(),
                            channel = %channel.address,
                            error = %e,
                            "value refresh skipped"
                        );
                    }
                }
            }
        }
        debug!(interface_id = self.id(), channels = refreshed, "values refreshed");
        Ok(())
    }

    /// Fetch a device's descriptions again and rebuild its entities.
    pub(crate) async fn reload_device(&self, device_address: &str) -> Result<(), CoreError> {
        let client = self.raw_client().await?;
        let root = client.get_device_description(device_address).await?;
        let mut descriptions = Vec::with_capacity(root.children.len() + 1);
        for child in &root.children {
            descriptions.push(client.get_device_description(child).await?);
        }
        descriptions.insert(0, root);

        let paramsets = self.fetch_paramsets(&client, &descriptions).await?;
        self.submit_and_wait(Update::Described {
            descriptions,
            paramsets,
        })
        .await?;
        info!(interface_id = self.id(), device = device_address, "device reloaded");
        self.refresh_values(Some(device_address)).await
    }

    /// Fetch one paramset kind of a device again.
    pub(crate) async fn reload_paramsets(
        &self,
        device_address: &str,
        kind: ParamsetKind,
    ) -> Result<(), CoreError> {
        let client = self.client().await?;
        let Some(root) = self.descriptions.device(device_address) else {
            return Err(CoreError::DeviceNotFound {
                address: device_address.to_owned(),
            });
        };
        let mut descriptions = self.descriptions.channels_of(device_address);
        descriptions.insert(0, root);

        let mut paramsets = Vec::new();
        for description in &descriptions {
            if description.paramset_kinds().contains(&kind) {
                let parameters = client
                    .get_paramset_description(&description.address, kind)
                    .await?;
                paramsets.push(PersistedParamset {
                    address: description.address.clone(),
                    kind,
                    parameters,
                });
            }
        }
        self.submit_and_wait(Update::Described {
            descriptions,
            paramsets: self.merge_other_kinds(device_address, kind, paramsets),
        })
        .await
    }

    /// Keep cached paramsets of the kinds not being reloaded.
    fn merge_other_kinds(
        &self,
        device_address: &str,
        reloaded: ParamsetKind,
        mut fresh: Vec<PersistedParamset>,
    ) -> Vec<PersistedParamset> {
        let mut addresses = vec![device_address.to_owned()];
        addresses.extend(
            self.descriptions
                .channels_of(device_address)
                .into_iter()
                .map(|c| c.address),
        );
        for address in addresses {
            for kind in [ParamsetKind::Values, ParamsetKind::Master] {
                if kind == reloaded {
                    continue;
                }
                if let Some(parameters) = self.descriptions.paramset(&address, kind) {
                    fresh.push(PersistedParamset {
                        address: address.clone(),
                        kind,
                        parameters: (*parameters).clone(),
                    });
                }
            }
        }
        fresh
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Dispatch one inbound event. Value pushes are proposed right away;
    /// anything that needs backend calls runs as background work so later
    /// events are not held up.
    pub(crate) async fn handle_callback(self: &Arc<Self>, event: CallbackEvent) {
        self.health.lock().await.record_callback(Instant::now());

        let result = match event {
            CallbackEvent::ValueChanged {
                channel_address,
                parameter,
                value,
            } => self.submit(Update::Value {
                channel_address,
                parameter,
                value,
                source: ValueSource::Push,
                at: Utc::now(),
            }),
            CallbackEvent::DeviceNew { descriptions } => {
                let iface = Arc::clone(self);
                self.spawn_work("new devices", async move {
                    iface.on_new_devices(descriptions).await
                });
                Ok(())
            }
            CallbackEvent::DeviceDeleted { address } => self.submit(Update::Deleted { address }),
            CallbackEvent::DeviceUpdated { address, hint: 0 } => {
                self.spawn_reload(address);
                Ok(())
            }
            CallbackEvent::DeviceUpdated { address, hint } => {
                info!(interface_id = self.id(), device = %address, hint, "device links changed");
                Ok(())
            }
            CallbackEvent::DeviceReplaced {
                old_address,
                new_address,
            } => {
                info!(
                    interface_id = self.id(),
                    old = %old_address,
                    new = %new_address,
                    "device replaced"
                );
                let result = self.submit(Update::Deleted {
                    address: old_address,
                });
                if result.is_ok() {
                    self.spawn_reload(new_address);
                }
                result
            }
            CallbackEvent::DeviceReadded { addresses } => {
                for address in addresses.into_iter().filter(|a| !a.contains(':')) {
                    self.spawn_reload(address);
                }
                Ok(())
            }
            CallbackEvent::InterfaceUnreachable { code, message } => {
                warn!(
                    interface_id = self.id(),
                    code,
                    %message,
                    "backend reports interface unreachable"
                );
                self.record_failure(&message).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(interface_id = self.id(), error = %e, "callback handling failed");
        }
    }

    async fn on_new_devices(&self, descriptions: Vec<DeviceDescription>) -> Result<(), CoreError> {
        // Backends re-announce known devices; only new or changed ones matter.
        let changed: BTreeSet<String> = descriptions
            .iter()
            .filter(|d| d.is_device())
            .filter(|root| {
                self.descriptions.device(&root.address).is_none_or(|cached| {
                    cached.device_type != root.device_type || cached.version != root.version
                })
            })
            .map(|root| root.address.clone())
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let descriptions: Vec<DeviceDescription> = descriptions
            .into_iter()
            .filter(|d| changed.contains(address::device_address(&d.address)))
            .collect();

        let client = match self.raw_client().await {
            Ok(client) => client,
            Err(e) => {
                // Completed by the next device list sync.
                warn!(interface_id = self.id(), error = %e, "new devices stored without paramsets");
                return self
                    .submit_and_wait(Update::Described {
                        descriptions,
                        paramsets: Vec::new(),
                    })
                    .await;
            }
        };
        let paramsets = self.fetch_paramsets(&client, &descriptions).await?;
        self.submit_and_wait(Update::Described {
            descriptions,
            paramsets,
        })
        .await?;

        // Pushes that arrived before the descriptions were dropped.
        for device in &changed {
            self.refresh_values(Some(device)).await?;
        }
        Ok(())
    }

    /// Run backend work off the calling task. Stopped with the central.
    fn spawn_work<F>(&self, what: &'static str, work: F)
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let cancel = self.shared.cancel.clone();
        let interface_id = self.id().to_owned();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(%interface_id, work = what, "background work cancelled");
                }
                result = work => {
                    if let Err(e) = result {
                        warn!(%interface_id, work = what, error = %e, "background work failed");
                    }
                }
            }
        });
    }

    fn spawn_reload(self: &Arc<Self>, device_address: String) {
        let iface = Arc::clone(self);
        self.spawn_work("device reload", async move {
            iface.reload_device(&device_address).await
        });
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Seed the caches from disk. Runs before the apply task starts.
    pub(crate) fn restore(&self, outcome: LoadOutcome) -> Option<CentralEvent> {
        let (snapshot, event) = match outcome {
            LoadOutcome::Missing => return None,
            LoadOutcome::Loaded(snapshot) => (snapshot, None),
            LoadOutcome::Recovered { snapshot, error } => {
                warn!(
                    interface_id = self.id(),
                    error = %error,
                    "persisted state recovered from backup"
                );
                let event = CentralEvent::PersistenceRecovered {
                    interface_id: self.id().to_owned(),
                    restored: true,
                    reason: error.to_string(),
                };
                (snapshot, Some(event))
            }
            LoadOutcome::Discarded { error } => {
                warn!(
                    interface_id = self.id(),
                    error = %error,
                    "persisted state discarded, re-fetching"
                );
                return Some(CentralEvent::PersistenceRecovered {
                    interface_id: self.id().to_owned(),
                    restored: false,
                    reason: error.to_string(),
                });
            }
        };

        self.descriptions.import(snapshot.descriptions);
        self.values.restore(snapshot.values);
        for device in self.descriptions.device_addresses() {
            self.upsert_device(&device);
            self.materialize(&device);
        }
        info!(
            interface_id = self.id(),
            devices = self.devices.len(),
            values = self.values.len(),
            "restored persisted state"
        );
        event
    }

    pub(crate) fn snapshot(&self) -> InterfaceSnapshot {
        InterfaceSnapshot::new(self.id(), self.descriptions.export(), self.values.export())
    }

    // ── Apply path ───────────────────────────────────────────────────

    /// Apply one proposed update. Only the apply task calls this.
    pub(crate) fn apply(self: &Arc<Self>, update: Update) {
        match update {
            Update::Value {
                channel_address,
                parameter,
                value,
                source,
                at,
            } => self.apply_value(&channel_address, &parameter, value, source, at),
            Update::Paramset {
                address,
                values,
                source,
                at,
            } => {
                for (parameter, value) in values {
                    self.apply_value(&address, &parameter, value, source, at);
                }
            }
            Update::Described {
                descriptions,
                paramsets,
            } => self.apply_described(descriptions, paramsets),
            Update::Deleted { address } => self.apply_deleted(&address),
            Update::Availability => {
                if !self.state().is_usable() {
                    self.values.mark_uncertain(None);
                }
                self.refresh_entities(None);
            }
            Update::Rematerialize => {
                for device in self.descriptions.device_addresses() {
                    self.materialize(&device);
                }
            }
        }
    }

    fn apply_value(
        self: &Arc<Self>,
        channel_address: &str,
        parameter: &str,
        value: Value,
        source: ValueSource,
        at: DateTime<Utc>,
    ) {
        let Some(description) =
            self.descriptions
                .parameter(channel_address, ParamsetKind::Values, parameter)
        else {
            debug!(
                interface_id = self.id(),
                channel = channel_address,
                parameter,
                "value for undescribed parameter dropped"
            );
            return;
        };
        let value = value.coerce(description.kind).unwrap_or(value);
        let previous = self.values.peek(channel_address, parameter);

        let outcome = self
            .values
            .apply(channel_address, parameter, value.clone(), Validity::Confirmed, at);
        if outcome == crate::store::ApplyOutcome::Rejected {
            debug!(
                interface_id = self.id(),
                channel = channel_address,
                parameter,
                ?source,
                "older value rejected"
            );
            return;
        }

        let device = address::device_address(channel_address).to_owned();
        if address::channel_no(channel_address) == Some(0) {
            match parameter {
                UNREACH => self.set_reachable(&device, !value.as_bool().unwrap_or(false)),
                CONFIG_PENDING => {
                    let was_pending = previous.and_then(|p| p.value.as_bool()).unwrap_or(false);
                    let pending = value.as_bool().unwrap_or(false);
                    if let Some(mut d) = self.devices.get_mut(&device) {
                        d.config_pending = pending;
                    }
                    if was_pending && !pending && source == ValueSource::Push {
                        self.spawn_reload(device.clone());
                    }
                }
                _ => {}
            }
        }

        if source == ValueSource::Push && is_event_parameter(parameter, &description) {
            let _ = self.shared.event_tx.send(CentralEvent::DeviceTrigger {
                interface_id: self.id().to_owned(),
                channel_address: channel_address.to_owned(),
                parameter: parameter.to_owned(),
                value: value.clone(),
            });
        }

        let ids = self
            .shared
            .entities
            .backed_by(self.id(), &ValueKey::new(channel_address, parameter));
        self.refresh_ids(&ids);
    }

    fn set_reachable(&self, device_address: &str, reachable: bool) {
        let changed = self
            .devices
            .get_mut(device_address)
            .is_some_and(|mut d| std::mem::replace(&mut d.reachable, reachable) != reachable);
        if changed {
            info!(
                interface_id = self.id(),
                device = device_address,
                reachable,
                "device reachability changed"
            );
            self.refresh_entities(Some(device_address));
        }
    }

    fn apply_described(
        &self,
        descriptions: Vec<DeviceDescription>,
        paramsets: Vec<PersistedParamset>,
    ) {
        let affected: BTreeSet<String> = descriptions
            .iter()
            .map(|d| address::device_address(&d.address).to_owned())
            .collect();

        let mut created = Vec::new();
        for root in descriptions.iter().filter(|d| d.is_device()) {
            match self.descriptions.device(&root.address) {
                Some(cached) => {
                    if cached.device_type != root.device_type {
                        info!(
                            interface_id = self.id(),
                            device = %root.address,
                            from = %cached.device_type,
                            to = %root.device_type,
                            "device type changed"
                        );
                        self.values.invalidate(&root.address);
                    }
                    self.descriptions.remove_device(&root.address);
                }
                None => created.push(root.address.clone()),
            }
        }

        self.descriptions.insert_descriptions(descriptions);
        for p in paramsets {
            self.descriptions.insert_paramset(&p.address, p.kind, p.parameters);
        }
        for device in &affected {
            if self.descriptions.contains_device(device) {
                self.upsert_device(device);
                self.materialize(device);
            }
        }

        if !created.is_empty() {
            info!(interface_id = self.id(), count = created.len(), "devices created");
            let _ = self.shared.event_tx.send(CentralEvent::DevicesCreated {
                interface_id: self.id().to_owned(),
                addresses: created,
            });
        }
    }

    fn apply_deleted(&self, address: &str) {
        if address.contains(':') {
            debug!(interface_id = self.id(), channel = address, "channel deletion ignored");
            return;
        }
        if !self.descriptions.remove_device(address) {
            return;
        }
        let values = self.values.invalidate(address);
        self.devices.remove(address);
        let entities = self.shared.entities.remove_device(self.id(), address);
        info!(
            interface_id = self.id(),
            device = address,
            values,
            entities = entities.len(),
            "device deleted"
        );
        let _ = self.shared.event_tx.send(CentralEvent::DevicesDeleted {
            interface_id: self.id().to_owned(),
            addresses: vec![address.to_owned()],
        });
    }

    fn upsert_device(&self, device_address: &str) {
        let Some(root) = self.descriptions.device(device_address) else {
            return;
        };
        let mut device = Device::from_description(self.id(), &root);
        device.channels = self
            .descriptions
            .channels_of(device_address)
            .into_iter()
            .map(|c| c.address)
            .collect();
        let maintenance = address::channel_address(device_address, 0);
        let flag = |parameter: &str| {
            self.values
                .peek(&maintenance, parameter)
                .and_then(|v| v.value.as_bool())
                .unwrap_or(false)
        };
        device.reachable = !flag(UNREACH);
        device.config_pending = flag(CONFIG_PENDING);
        self.devices.insert(device_address.to_owned(), device);
    }

    fn materialize(&self, device_address: &str) {
        let model = Arc::clone(&*self.shared.model.borrow());
        let materializer = Materializer {
            descriptions: &self.descriptions,
            values: &self.values,
            rules: &model.rules,
            schemas: &model.schemas,
        };
        let entities =
            materializer.device(self.id(), device_address, self.available(device_address));
        let report = sync_device(&self.shared.entities, self.id(), device_address, entities);
        if !report.is_empty() {
            debug!(
                interface_id = self.id(),
                device = device_address,
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                "entities synchronized"
            );
        }
    }

    /// Re-derive entity state for one device, or the whole interface.
    fn refresh_entities(&self, device_address: Option<&str>) {
        let ids: Vec<EntityId> = match device_address {
            Some(d) => self.shared.entities.ids_for_device(self.id(), d),
            None => self
                .shared
                .entities
                .for_interface(self.id())
                .iter()
                .map(|e| e.id.clone())
                .collect(),
        };
        self.refresh_ids(&ids);
    }

    fn refresh_ids(&self, ids: &[EntityId]) {
        if ids.is_empty() {
            return;
        }
        refresh_state(&self.shared.entities, &self.values, ids, |entity| {
            self.available(&entity.device_address)
        });
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Deregister from the backend and close the session. Best effort.
    pub(crate) async fn disconnect(&self) {
        let client = self.client.read().await.clone();
        if let Some(client) = client {
            if let Some(url) = self.callback_url.get() {
                if self.state().is_usable() {
                    if let Err(e) = client.deinit(url).await {
                        debug!(interface_id = self.id(), error = %e, "deinit failed (non-fatal)");
                    }
                }
            }
            if let Err(e) = client.logout().await {
                debug!(interface_id = self.id(), error = %e, "logout failed (non-fatal)");
            }
        }
        self.request_cancel.cancel();
        self.publish_state(ConnectionState::Disconnected);
    }
}
