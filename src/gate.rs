//! Arm Plugin Gate
//!
//! Server-side composition: binds a server-role [`PluginInterface`] to an
//! [`EntityStore`]. Incoming `Send*` tables are stored, `Get*` queries are
//! answered from the store, and the `Req*` commands are issued toward the
//! plugin with typed completions.
//!
//! ```text
//!  plugin ──SendHosts(table)──► Gate ──store(Hosts, table)──► EntityStore
//!  plugin ──GetMonitoringServerInfo──► Gate ──► reply(record)
//!  Gate ──ReqFetchItems──► plugin ──Items(table)──► on_done(Ok(table))
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Role;
use crate::correlator::{on_outcome, CommandOutcome, CommandRequest};
use crate::error::{HapiError, Result};
use crate::plugin::PluginInterface;
use crate::protocol::{
    ArmInfo, CommandCode, FetchHistoryRequest, LastEventId, MonitoringServerInfo, Record,
    ResponseCode, Timestamp, WireLayout,
};
use crate::table::ItemTable;

/// Entity family carried by a `Send*` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Triggers,
    Hosts,
    HostGroupElements,
    HostGroups,
    Events,
    HostParents,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Triggers,
        EntityKind::Hosts,
        EntityKind::HostGroupElements,
        EntityKind::HostGroups,
        EntityKind::Events,
        EntityKind::HostParents,
    ];

    /// Command that carries this entity family.
    pub fn command(self) -> CommandCode {
        match self {
            EntityKind::Triggers => CommandCode::SendUpdatedTriggers,
            EntityKind::Hosts => CommandCode::SendHosts,
            EntityKind::HostGroupElements => CommandCode::SendHostGroupElements,
            EntityKind::HostGroups => CommandCode::SendHostGroups,
            EntityKind::Events => CommandCode::SendUpdatedEvents,
            EntityKind::HostParents => CommandCode::SendHostParents,
        }
    }

    pub fn from_command(code: CommandCode) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.command() == code)
    }

    /// Updates are merged into what is stored instead of replacing it.
    pub fn is_incremental(self) -> bool {
        matches!(self, EntityKind::Triggers | EntityKind::Events)
    }
}

/// Persistence seam behind the gate
///
/// The gate only marshals; what "store" means is up to the implementor.
pub trait EntityStore: Send + Sync {
    fn store(&self, kind: EntityKind, table: ItemTable) -> Result<()>;

    fn fetch(&self, kind: EntityKind) -> Result<ItemTable>;

    fn monitoring_server_info(&self) -> Result<MonitoringServerInfo>;

    fn update_arm_info(&self, info: ArmInfo) -> Result<()>;

    fn last_event_id(&self) -> Result<LastEventId> {
        Ok(LastEventId { event_id: 0 })
    }

    fn time_of_last_event(&self) -> Result<Timestamp> {
        Ok(Timestamp::default())
    }

    fn timestamp_of_last_trigger(&self) -> Result<Timestamp> {
        Ok(Timestamp::default())
    }
}

// =============================================================================
// MemoryEntityStore
// =============================================================================

/// Process-local [`EntityStore`]
#[derive(Default)]
pub struct MemoryEntityStore {
    server_info: MonitoringServerInfo,
    tables: RwLock<HashMap<EntityKind, ItemTable>>,
    arm_info: RwLock<Option<ArmInfo>>,
}

impl MemoryEntityStore {
    pub fn new(server_info: MonitoringServerInfo) -> Self {
        Self {
            server_info,
            ..Default::default()
        }
    }

    /// Latest health record reported by the plugin.
    pub fn arm_info(&self) -> Option<ArmInfo> {
        self.arm_info.read().clone()
    }
}

impl EntityStore for MemoryEntityStore {
    fn store(&self, kind: EntityKind, table: ItemTable) -> Result<()> {
        let mut tables = self.tables.write();
        let stored = tables.entry(kind).or_default();
        if kind.is_incremental() {
            stored.groups.extend(table.groups);
        } else {
            *stored = table;
        }
        tracing::debug!("Stored {:?}: {} rows", kind, stored.len());
        Ok(())
    }

    fn fetch(&self, kind: EntityKind) -> Result<ItemTable> {
        Ok(self.tables.read().get(&kind).cloned().unwrap_or_default())
    }

    fn monitoring_server_info(&self) -> Result<MonitoringServerInfo> {
        Ok(self.server_info.clone())
    }

    fn update_arm_info(&self, info: ArmInfo) -> Result<()> {
        *self.arm_info.write() = Some(info);
        Ok(())
    }
}

// =============================================================================
// ArmPluginGate
// =============================================================================

/// Server endpoint for one Arm plugin
pub struct ArmPluginGate {
    plugin: PluginInterface,
    store: Arc<dyn EntityStore>,
}

impl ArmPluginGate {
    /// Register the server-side handlers on `plugin`.
    pub fn new(plugin: PluginInterface, store: Arc<dyn EntityStore>) -> Result<Self> {
        if plugin.role() != Role::Server {
            return Err(HapiError::Config(
                "an arm plugin gate needs a server-role endpoint".to_string(),
            ));
        }
        let gate = Self { plugin, store };
        gate.register_handlers();
        Ok(gate)
    }

    pub fn plugin(&self) -> &PluginInterface {
        &self.plugin
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn start(&self) -> Result<()> {
        self.plugin.start()
    }

    pub fn exit_sync(&self) {
        self.plugin.exit_sync();
    }

    fn register_handlers(&self) {
        let plugin = &self.plugin;

        let store = Arc::clone(&self.store);
        plugin.register_command_handler(
            CommandCode::GetMonitoringServerInfo,
            move |request: &CommandRequest<'_>| {
                let info = store.monitoring_server_info()?;
                request.reply(&info.encode()?)
            },
        );

        let store = Arc::clone(&self.store);
        plugin.register_command_handler(
            CommandCode::GetLastEventId,
            move |request: &CommandRequest<'_>| {
                request.reply(&store.last_event_id()?.encode())
            },
        );

        let store = Arc::clone(&self.store);
        plugin.register_command_handler(
            CommandCode::GetTimeOfLastEvent,
            move |request: &CommandRequest<'_>| {
                request.reply(&store.time_of_last_event()?.encode())
            },
        );

        let store = Arc::clone(&self.store);
        plugin.register_command_handler(
            CommandCode::GetTimestampOfLastTrigger,
            move |request: &CommandRequest<'_>| {
                request.reply(&store.timestamp_of_last_trigger()?.encode())
            },
        );

        let store = Arc::clone(&self.store);
        plugin.register_command_handler(
            CommandCode::SendArmInfo,
            move |request: &CommandRequest<'_>| {
                let info = ArmInfo::decode(request.body())?;
                tracing::debug!("Arm status {:?} (running: {})", info.status, info.running);
                store.update_arm_info(info)?;
                request.reply_ok()
            },
        );

        for kind in EntityKind::ALL {
            let store = Arc::clone(&self.store);
            plugin.register_table_handler(
                kind.command(),
                move |table: ItemTable, request: &CommandRequest<'_>| {
                    store.store(kind, table)?;
                    request.reply_ok()
                },
            );
        }
    }

    // -------------------------------------------------------------------------
    // Requests toward the plugin
    // -------------------------------------------------------------------------

    /// Ask the plugin to poll its monitoring system for fresh items.
    pub fn request_fetch_items<F>(&self, on_done: F) -> Result<u32>
    where
        F: FnOnce(Result<ItemTable>) + Send + 'static,
    {
        self.request_table(CommandCode::ReqFetchItems, &[], ResponseCode::Items, on_done)
    }

    pub fn request_fetch_history<F>(&self, request: &FetchHistoryRequest, on_done: F) -> Result<u32>
    where
        F: FnOnce(Result<ItemTable>) + Send + 'static,
    {
        self.request_table(
            CommandCode::ReqFetchHistory,
            &request.encode(),
            ResponseCode::History,
            on_done,
        )
    }

    pub fn request_fetch_triggers<F>(&self, on_done: F) -> Result<u32>
    where
        F: FnOnce(Result<ItemTable>) + Send + 'static,
    {
        self.request_table(CommandCode::ReqFetchTriggers, &[], ResponseCode::Triggers, on_done)
    }

    /// Ask the plugin process to shut down.
    pub fn request_terminate<F>(&self, on_done: F) -> Result<u32>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.plugin.send(
            CommandCode::ReqTerminate,
            &[],
            Some(on_outcome(move |outcome: CommandOutcome| {
                on_done(outcome.into_body().map(|_| ()))
            })),
        )
    }

    fn request_table<F>(
        &self,
        code: CommandCode,
        body: &[u8],
        expected: ResponseCode,
        on_done: F,
    ) -> Result<u32>
    where
        F: FnOnce(Result<ItemTable>) + Send + 'static,
    {
        self.plugin.send(
            code,
            body,
            Some(on_outcome(move |outcome: CommandOutcome| {
                on_done(table_reply(outcome, expected))
            })),
        )
    }
}

fn table_reply(outcome: CommandOutcome, expected: ResponseCode) -> Result<ItemTable> {
    let code = outcome.code();
    let body = outcome.into_body()?;
    if code != expected && code != ResponseCode::Ok {
        return Err(HapiError::ErrorReply(code));
    }
    ItemTable::decode(&body)
}
