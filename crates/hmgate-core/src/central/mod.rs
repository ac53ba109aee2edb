// ── Central Coordinator ──
//
// Full lifecycle management for one gateway: loads persisted caches,
// binds the callback listener, connects every configured interface,
// runs the per-interface background tasks, and exposes the host command
// surface. Cheaply cloneable via `Arc<CentralInner>`.

mod interface;
mod tasks;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hmgate_api::{CallbackServer, Paramset, ParamsetKind, Value};

use self::interface::{Interface, Update};
use crate::command::{self, Command, CommandEnvelope, EntityCommand, FieldWrite, validate_write};
use crate::config::CentralConfig;
use crate::error::CoreError;
use crate::health::ConnectionState;
use crate::model::{Device, Entity, EntityId, ValueSource};
use crate::rules::RuleSet;
use crate::schema::SchemaTable;
use crate::store::{CacheLookup, EntityStore, PersistentStore};
use crate::stream::{EntityStream, EntitySubscription};

const EVENT_CHANNEL_SIZE: usize = 256;

// ── Host notifications ───────────────────────────────────────────────

/// Notifications broadcast to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    InterfaceAvailable {
        interface_id: String,
    },
    InterfaceUnavailable {
        interface_id: String,
        reason: String,
    },
    DevicesCreated {
        interface_id: String,
        addresses: Vec<String>,
    },
    DevicesDeleted {
        interface_id: String,
        addresses: Vec<String>,
    },
    /// Button press or other event-only parameter.
    DeviceTrigger {
        interface_id: String,
        channel_address: String,
        parameter: String,
        value: Value,
    },
    /// Persisted state was unusable. `restored` tells whether the backup
    /// copy was loaded instead; otherwise everything is re-fetched.
    PersistenceRecovered {
        interface_id: String,
        restored: bool,
        reason: String,
    },
}

// ── Shared state ─────────────────────────────────────────────────────

/// Ignore rules and schemas the materializer runs with.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntityRules {
    pub rules: RuleSet,
    pub schemas: SchemaTable,
}

/// State every interface reaches into.
pub(crate) struct Shared {
    pub central_id: String,
    pub entities: EntityStore,
    pub model: watch::Sender<Arc<EntityRules>>,
    pub event_tx: broadcast::Sender<CentralEvent>,
    /// Stops background tasks and the work they spawn.
    pub cancel: CancellationToken,
}

// ── Central ──────────────────────────────────────────────────────────

/// The main entry point for hosts.
#[derive(Clone)]
pub struct Central {
    inner: Arc<CentralInner>,
}

struct CentralInner {
    config: CentralConfig,
    shared: Arc<Shared>,
    interfaces: BTreeMap<String, Arc<Interface>>,
    persist: Option<PersistentStore>,
    callback: Mutex<Option<Arc<CallbackServer>>>,
    /// Stops background tasks.
    cancel: CancellationToken,
    /// Stops in-flight requests; cancelled after the final deinit.
    request_cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

impl Central {
    /// Build a central from configuration. Does not touch the network or
    /// disk; call [`start`](Self::start) next.
    pub fn new(config: CentralConfig) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        for iface in &config.interfaces {
            if !seen.insert(iface.interface_id.as_str()) {
                return Err(CoreError::Config {
                    message: format!("duplicate interface id {}", iface.interface_id),
                });
            }
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (model, _) = watch::channel(Arc::new(EntityRules {
            rules: config.rules.clone(),
            schemas: config.schemas.clone(),
        }));
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            central_id: config.central_id.clone(),
            entities: EntityStore::new(),
            model,
            event_tx,
            cancel: cancel.clone(),
        });

        let request_cancel = CancellationToken::new();
        let interfaces = config
            .interfaces
            .iter()
            .map(|iface| {
                let interface = Interface::new(
                    iface.clone(),
                    Arc::clone(&shared),
                    &config.cache,
                    config.health.clone(),
                    config.request.clone(),
                    request_cancel.child_token(),
                );
                (iface.interface_id.clone(), Arc::new(interface))
            })
            .collect();

        let persist = config
            .storage_dir
            .as_ref()
            .map(|dir| PersistentStore::new(dir, &config.central_id));

        Ok(Self {
            inner: Arc::new(CentralInner {
                config,
                shared,
                interfaces,
                persist,
                callback: Mutex::new(None),
                cancel,
                request_cancel,
                task_handles: Mutex::new(Vec::new()),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        })
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load persisted state, bind the callback listener, and connect
    /// every interface.
    ///
    /// An interface whose backend cannot be reached starts out
    /// disconnected and keeps retrying on the reconnect backoff. Failing
    /// to bind the listener, bad credentials, and bad transport settings
    /// abort startup.
    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if *lifecycle != Lifecycle::Idle {
                return Err(CoreError::Internal("central already started".into()));
            }
            *lifecycle = Lifecycle::Running;
        }

        // Persisted state first: restart must not re-fetch what is on disk.
        if let Some(store) = &self.inner.persist {
            for iface in self.inner.interfaces.values() {
                let outcome = store.load(iface.id()).await;
                if let Some(event) = iface.restore(outcome) {
                    let _ = self.inner.shared.event_tx.send(event);
                }
            }
        }

        let server = Arc::new(CallbackServer::bind(self.inner.config.callback_bind).await?);
        let callback_url = server.url(&self.inner.config.callback_host);
        info!(%callback_url, local = %server.local_addr(), "callback listener bound");
        *self.inner.callback.lock().await = Some(Arc::clone(&server));

        for iface in self.inner.interfaces.values() {
            iface.set_callback_url(callback_url.clone());
            let receiver = server
                .register(iface.id(), iface.descriptions.known_devices())
                .await;
            self.spawn_interface_tasks(iface, receiver).await;

            match iface.establish().await {
                Ok(()) => {
                    iface.record_success().await;
                    tasks::spawn_refresh(iface, &self.inner.cancel);
                }
                Err(e @ (CoreError::AuthenticationFailed { .. } | CoreError::Config { .. })) => {
                    error!(interface_id = iface.id(), error = %e, "interface setup failed");
                    self.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        interface_id = iface.id(),
                        error = %e,
                        "interface unreachable at startup, retrying in background"
                    );
                }
            }

            let handle = tokio::spawn(tasks::health_task(
                Arc::clone(iface),
                self.inner.cancel.clone(),
            ));
            self.inner.task_handles.lock().await.push(handle);
        }

        info!(
            central_id = %self.inner.config.central_id,
            interfaces = self.inner.interfaces.len(),
            entities = self.inner.shared.entities.len(),
            "central started"
        );
        Ok(())
    }

    async fn spawn_interface_tasks(
        &self,
        iface: &Arc<Interface>,
        receiver: hmgate_api::CallbackReceiver,
    ) {
        let cancel = self.inner.cancel.clone();
        let mut handles = self.inner.task_handles.lock().await;

        if let Some(rx) = iface.take_apply_rx().await {
            handles.push(tokio::spawn(tasks::apply_task(
                Arc::clone(iface),
                rx,
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(tasks::callback_task(
            Arc::clone(iface),
            receiver,
            cancel.clone(),
        )));
        if let Some(rx) = iface.take_command_rx().await {
            handles.push(tokio::spawn(tasks::command_processor_task(
                Arc::clone(iface),
                rx,
                cancel,
            )));
        }
    }

    /// Stop background tasks, deregister from every backend, and flush
    /// the Persistent Store. Safe to call more than once and
    /// concurrently; later calls wait for the first to finish.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        *lifecycle = Lifecycle::Stopped;

        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        let disconnects = self.inner.interfaces.values().map(|iface| iface.disconnect());
        futures_util::future::join_all(disconnects).await;
        self.inner.request_cancel.cancel();

        if let Some(server) = self.inner.callback.lock().await.take() {
            for iface in self.inner.interfaces.values() {
                server.deregister(iface.id()).await;
            }
            server.shutdown().await;
        }

        if let Some(store) = &self.inner.persist {
            for iface in self.inner.interfaces.values() {
                if let Err(e) = store.save(&iface.snapshot()).await {
                    warn!(interface_id = iface.id(), error = %e, "failed to persist state");
                }
            }
        }

        info!(central_id = %self.inner.config.central_id, "central stopped");
    }

    // ── Interfaces ───────────────────────────────────────────────────

    fn interface(&self, interface_id: &str) -> Result<&Arc<Interface>, CoreError> {
        self.inner
            .interfaces
            .get(interface_id)
            .ok_or_else(|| CoreError::InterfaceNotFound {
                interface_id: interface_id.to_owned(),
            })
    }

    /// The interface that knows `address` (device or channel).
    fn interface_for(&self, address: &str) -> Result<&Arc<Interface>, CoreError> {
        let device = crate::model::address::device_address(address);
        self.inner
            .interfaces
            .values()
            .find(|iface| iface.descriptions.contains_device(device))
            .ok_or_else(|| CoreError::DeviceNotFound {
                address: device.to_owned(),
            })
    }

    pub fn interface_ids(&self) -> Vec<String> {
        self.inner.interfaces.keys().cloned().collect()
    }

    pub fn connection_state(&self, interface_id: &str) -> Result<ConnectionState, CoreError> {
        Ok(self.interface(interface_id)?.state())
    }

    /// Watch an interface's connection state.
    pub fn connection_state_watch(
        &self,
        interface_id: &str,
    ) -> Result<watch::Receiver<ConnectionState>, CoreError> {
        Ok(self.interface(interface_id)?.subscribe_state())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner
            .interfaces
            .values()
            .flat_map(|iface| iface.devices())
            .collect()
    }

    pub fn device(&self, device_address: &str) -> Option<Device> {
        self.inner
            .interfaces
            .values()
            .find_map(|iface| iface.device(device_address))
    }

    pub fn events(&self) -> broadcast::Receiver<CentralEvent> {
        self.inner.shared.event_tx.subscribe()
    }

    /// The address registered with backends; `None` before start.
    pub async fn callback_url(&self) -> Option<String> {
        self.inner
            .callback
            .lock()
            .await
            .as_ref()
            .map(|server| server.url(&self.inner.config.callback_host))
    }

    // ── Values ───────────────────────────────────────────────────────

    /// Read one VALUES parameter.
    ///
    /// Served from the Value Cache when a confirmed entry is younger than
    /// `max_age` (the configured default when `None`); otherwise fetched
    /// from the backend and cached. Fails fast with `Unreachable` while
    /// the interface is disconnected.
    pub async fn get_value(
        &self,
        interface_id: &str,
        channel_address: &str,
        parameter: &str,
        max_age: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let iface = self.interface(interface_id)?;
        let description =
            lookup_parameter(iface, channel_address, ParamsetKind::Values, parameter)?;
        if !description.operations.is_readable() {
            return Err(CoreError::InvalidParameter {
                message: format!("{channel_address}/{parameter} is not readable"),
            });
        }

        let client = iface.client().await?;

        let max_age = max_age.unwrap_or(self.inner.config.cache.default_max_age);
        if let CacheLookup::Hit(cached) = iface.values.get(channel_address, parameter, max_age) {
            if cached.is_confirmed() {
                return Ok(cached.value);
            }
        }

        let at = Utc::now();
        let result = client
            .get_value(channel_address, parameter)
            .await
            .map_err(CoreError::from);
        iface.note(&result).await;
        let fetched = result?;
        let fetched = fetched.coerce(description.kind).unwrap_or(fetched);

        iface
            .submit_and_wait(Update::Value {
                channel_address: channel_address.to_owned(),
                parameter: parameter.to_owned(),
                value: fetched.clone(),
                source: ValueSource::Pull,
                at,
            })
            .await?;

        // A push newer than our request may have won.
        Ok(iface
            .values
            .peek(channel_address, parameter)
            .map_or(fetched, |cached| cached.value))
    }

    /// Write one VALUES parameter after validating it against its
    /// description. Read-only parameters fail with `PermissionDenied`
    /// before anything is sent.
    pub async fn set_value(
        &self,
        interface_id: &str,
        channel_address: &str,
        parameter: &str,
        value: impl Into<Value>,
    ) -> Result<(), CoreError> {
        let iface = self.interface(interface_id)?;
        let description =
            lookup_parameter(iface, channel_address, ParamsetKind::Values, parameter)?;
        let value = validate_write(channel_address, parameter, &description, &value.into())?;

        self.execute(
            iface,
            Command::Write {
                writes: vec![FieldWrite {
                    channel_address: channel_address.to_owned(),
                    parameter: parameter.to_owned(),
                    value,
                }],
            },
        )
        .await
    }

    /// Read a whole paramset. VALUES results also refresh the cache.
    pub async fn get_paramset(
        &self,
        interface_id: &str,
        address: &str,
        kind: ParamsetKind,
    ) -> Result<Paramset, CoreError> {
        let iface = self.interface(interface_id)?;
        if iface.descriptions.description(address).is_none() {
            return Err(CoreError::DeviceNotFound {
                address: address.to_owned(),
            });
        }
        let client = iface.client().await?;

        let at = Utc::now();
        let result = client.get_paramset(address, kind).await.map_err(CoreError::from);
        iface.note(&result).await;
        let mut values = result?;

        if let Some(descriptions) = iface.descriptions.paramset(address, kind) {
            for (parameter, value) in &mut values {
                if let Some(description) = descriptions.get(parameter) {
                    if let Some(coerced) = value.coerce(description.kind) {
                        *value = coerced;
                    }
                }
            }
        }

        if kind == ParamsetKind::Values {
            iface
                .submit_and_wait(Update::Paramset {
                    address: address.to_owned(),
                    values: values.clone(),
                    source: ValueSource::Pull,
                    at,
                })
                .await?;
        }
        Ok(values)
    }

    /// Write several parameters of one paramset at once. Every entry is
    /// validated first; one bad entry rejects the whole write.
    pub async fn put_paramset(
        &self,
        interface_id: &str,
        address: &str,
        kind: ParamsetKind,
        values: Paramset,
    ) -> Result<(), CoreError> {
        let iface = self.interface(interface_id)?;
        if kind == ParamsetKind::Link {
            return Err(CoreError::Unsupported {
                operation: "put_paramset on LINK paramsets".into(),
            });
        }

        let mut validated = Paramset::new();
        for (parameter, value) in values {
            let description = lookup_parameter(iface, address, kind, &parameter)?;
            let value = validate_write(address, &parameter, &description, &value)?;
            validated.insert(parameter, value);
        }

        self.execute(
            iface,
            Command::PutParamset {
                address: address.to_owned(),
                kind,
                values: validated,
            },
        )
        .await
    }

    /// Queue a validated command on the interface's command processor.
    async fn execute(&self, iface: &Interface, command: Command) -> Result<(), CoreError> {
        if !iface.state().is_usable() {
            return Err(CoreError::Unreachable {
                reason: format!("interface {} is disconnected", iface.id()),
            });
        }

        let (response_tx, response_rx) = oneshot::channel();
        iface
            .command_sender()
            .send(CommandEnvelope {
                command,
                response_tx,
            })
            .await
            .map_err(|_| CoreError::ShuttingDown)?;

        response_rx.await.map_err(|_| CoreError::ShuttingDown)?
    }

    // ── Entities ─────────────────────────────────────────────────────

    pub fn list_entities(&self) -> Arc<Vec<Arc<Entity>>> {
        self.inner.shared.entities.snapshot()
    }

    pub fn entity(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.inner.shared.entities.get(id)
    }

    pub fn entities_for_device(&self, device_address: &str) -> Vec<Arc<Entity>> {
        self.inner
            .interfaces
            .keys()
            .flat_map(|iface| self.inner.shared.entities.for_device(iface, device_address))
            .collect()
    }

    /// Stream of full entity snapshots, emitted on every change.
    pub fn entities(&self) -> EntityStream<Entity> {
        self.inner.shared.entities.stream()
    }

    /// State changes of one entity; ends when the entity is removed.
    pub fn subscribe(&self, id: &EntityId) -> Result<EntitySubscription<Entity>, CoreError> {
        self.inner
            .shared
            .entities
            .subscribe(id)
            .ok_or_else(|| CoreError::EntityNotFound { id: id.to_string() })
    }

    /// Run a high-level command on an entity. The resulting writes go out
    /// in order as one unit on the entity's interface.
    pub async fn entity_command(
        &self,
        id: &EntityId,
        command: EntityCommand,
    ) -> Result<(), CoreError> {
        let entity = self
            .entity(id)
            .ok_or_else(|| CoreError::EntityNotFound { id: id.to_string() })?;
        let iface = self.interface(&entity.interface_id)?;

        let mut writes = Vec::new();
        for write in command::resolve(&entity, &command)? {
            let description = lookup_parameter(
                iface,
                &write.channel_address,
                ParamsetKind::Values,
                &write.parameter,
            )?;
            let value = validate_write(
                &write.channel_address,
                &write.parameter,
                &description,
                &write.value,
            )?;
            writes.push(FieldWrite { value, ..write });
        }
        debug!(entity = %id, %command, writes = writes.len(), "entity command resolved");

        self.execute(iface, Command::Write { writes }).await
    }

    // ── Reloads ──────────────────────────────────────────────────────

    /// Fetch a device's descriptions again, rebuild its entities, and
    /// re-read its values.
    pub async fn reload_device(&self, device_address: &str) -> Result<(), CoreError> {
        let iface = self.interface_for(device_address)?;
        if !iface.state().is_usable() {
            return Err(CoreError::Unreachable {
                reason: format!("interface {} is disconnected", iface.id()),
            });
        }
        let result = iface.reload_device(device_address).await;
        iface.note(&result).await;
        result
    }

    /// Re-fetch one paramset kind's descriptions for a device.
    pub async fn reload_paramsets(
        &self,
        device_address: &str,
        kind: ParamsetKind,
    ) -> Result<(), CoreError> {
        let iface = self.interface_for(device_address)?;
        let result = iface.reload_paramsets(device_address, kind).await;
        iface.note(&result).await;
        result
    }

    /// Swap the ignore rules and rebuild every entity.
    pub async fn set_rules(&self, rules: RuleSet) -> Result<(), CoreError> {
        self.inner.shared.model.send_modify(|model| {
            *model = Arc::new(EntityRules {
                rules,
                schemas: model.schemas.clone(),
            });
        });
        self.rematerialize().await
    }

    /// Swap the custom-entity schemas and rebuild every entity.
    pub async fn set_schemas(&self, schemas: SchemaTable) -> Result<(), CoreError> {
        self.inner.shared.model.send_modify(|model| {
            *model = Arc::new(EntityRules {
                rules: model.rules.clone(),
                schemas,
            });
        });
        self.rematerialize().await
    }

    async fn rematerialize(&self) -> Result<(), CoreError> {
        for iface in self.inner.interfaces.values() {
            iface.submit_and_wait(Update::Rematerialize).await?;
        }
        Ok(())
    }
}

fn lookup_parameter(
    iface: &Interface,
    address: &str,
    kind: ParamsetKind,
    parameter: &str,
) -> Result<hmgate_api::ParameterDescription, CoreError> {
    let device = crate::model::address::device_address(address);
    if !iface.descriptions.contains_device(device) {
        return Err(CoreError::DeviceNotFound {
            address: device.to_owned(),
        });
    }
    iface
        .descriptions
        .parameter(address, kind, parameter)
        .ok_or_else(|| CoreError::ParameterNotFound {
            channel: address.to_owned(),
            parameter: parameter.to_owned(),
        })
}
