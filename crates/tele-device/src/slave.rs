//! Controlled station simulation
//!
//! Serves interrogation and command requests from a table of configured
//! points. Points live in the store under string ids handed out by a
//! per-table counter; a point only takes part in the protocol once both
//! of its addresses are set, so half-edited points never leak onto the
//! link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use tele_protocol::{
    Cause, Command, Connection, Data, FreezeCode, LinkNetwork, Server, ServerHandler, GLOBAL_ASDU,
};

use crate::codec::{data_from_json, value_to_json};
use crate::device::{Device, DeviceProperties};
use crate::error::DeviceError;
use crate::registry::CallbackRegistry;
use crate::store::ObservableStore;

/// Actions accepted by a [`Slave`]
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveAction {
    /// Change one connection property
    SetProperty { path: String, value: Value },
    /// Create a data point with default payloads, returns its id
    AddData,
    /// Delete a data point
    RemoveData { data_id: String },
    /// Change one field of a data point
    ChangeData {
        data_id: String,
        path: String,
        value: Value,
    },
    /// Push a data point to every connected master
    NotifyData { data_id: String },
    /// Create a command point with default payloads, returns its id
    AddCommand,
    /// Delete a command point
    RemoveCommand { command_id: String },
    /// Change one field of a command point
    ChangeCommand {
        command_id: String,
        path: String,
        value: Value,
    },
}

impl SlaveAction {
    /// Decode a string-keyed action request from a front end
    pub fn from_request(name: &str, args: &[Value]) -> Result<Self, DeviceError> {
        match name {
            "set_property" => Ok(Self::SetProperty {
                path: arg_str(name, args, 0)?.to_string(),
                value: arg(name, args, 1)?.clone(),
            }),
            "add_data" => Ok(Self::AddData),
            "remove_data" => Ok(Self::RemoveData {
                data_id: arg_str(name, args, 0)?.to_string(),
            }),
            "change_data" => Ok(Self::ChangeData {
                data_id: arg_str(name, args, 0)?.to_string(),
                path: arg_str(name, args, 1)?.to_string(),
                value: arg(name, args, 2)?.clone(),
            }),
            "notify_data" => Ok(Self::NotifyData {
                data_id: arg_str(name, args, 0)?.to_string(),
            }),
            "add_command" => Ok(Self::AddCommand),
            "remove_command" => Ok(Self::RemoveCommand {
                command_id: arg_str(name, args, 0)?.to_string(),
            }),
            "change_command" => Ok(Self::ChangeCommand {
                command_id: arg_str(name, args, 0)?.to_string(),
                path: arg_str(name, args, 1)?.to_string(),
                value: arg(name, args, 2)?.clone(),
            }),
            _ => Err(DeviceError::InvalidAction(name.to_string())),
        }
    }
}

/// State shared between the device front and the link handler
struct SlaveShared {
    store: Arc<ObservableStore>,
    notify_cbs: CallbackRegistry<Data>,
    next_data_id: AtomicU64,
    next_command_id: AtomicU64,
}

impl SlaveShared {
    fn next_data_id(&self) -> String {
        self.next_data_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn next_command_id(&self) -> String {
        self.next_command_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }
}

/// Controlled station endpoint serving configured data and command points
pub struct Slave {
    network: LinkNetwork,
    shared: Arc<SlaveShared>,
    server: Mutex<Option<Server>>,
}

impl Slave {
    /// Create a slave from a stored configuration
    ///
    /// Configured data and command points are keyed by freshly generated
    /// ids; command points start with no recorded value.
    pub fn new(network: LinkNetwork, conf: &Value) -> Self {
        let properties = DeviceProperties::from_value(conf.get("properties"));

        let mut next_data_id = 1u64;
        let mut data = Map::new();
        for point in conf_points(conf, "data") {
            data.insert(next_data_id.to_string(), point.clone());
            next_data_id += 1;
        }

        let mut next_command_id = 1u64;
        let mut commands = Map::new();
        for point in conf_points(conf, "commands") {
            let mut point = point.clone();
            if let Some(map) = point.as_object_mut() {
                map.insert("value".to_string(), Value::Null);
            }
            commands.insert(next_command_id.to_string(), point);
            next_command_id += 1;
        }

        let store = ObservableStore::new(json!({
            "properties": properties.to_json(),
            "connection_count": 0,
            "data": data,
            "commands": commands,
        }));

        Self {
            network,
            shared: Arc::new(SlaveShared {
                store: Arc::new(store),
                notify_cbs: CallbackRegistry::new(),
                next_data_id: AtomicU64::new(next_data_id),
                next_command_id: AtomicU64::new(next_command_id),
            }),
            server: Mutex::new(None),
        }
    }

    fn act_notify_data(&self, data_id: &str) {
        let point = self.shared.store.get(&["data", data_id]);
        let data = match point.as_ref().map(data_from_json) {
            Some(Ok(data)) => data,
            // Unset addresses or malformed payloads stay local
            _ => return,
        };
        info!("notifying data change for {}", data_id);
        self.shared.notify_cbs.notify(&data);
    }
}

impl Device for Slave {
    type Action = SlaveAction;
    type Handle = Server;

    fn data(&self) -> &Arc<ObservableStore> {
        &self.shared.store
    }

    fn conf(&self) -> Value {
        let data: Vec<Value> = point_values(&self.shared.store, "data");
        let commands: Vec<Value> = point_values(&self.shared.store, "commands")
            .into_iter()
            .map(|point| {
                json!({
                    "type": point.get("type"),
                    "asdu": point.get("asdu"),
                    "io": point.get("io"),
                    "success": point.get("success"),
                })
            })
            .collect();

        json!({
            "properties": self.shared.store.get(&["properties"]),
            "data": data,
            "commands": commands,
        })
    }

    async fn start(&self) -> Result<Server, DeviceError> {
        let properties =
            DeviceProperties::from_value(self.shared.store.get(&["properties"]).as_ref());
        let handler = Arc::new(SlaveHandler {
            shared: self.shared.clone(),
        });
        let server = self
            .network
            .listen(properties.address(), handler, properties.options())?;
        *lock(&self.server) = Some(server.clone());
        Ok(server)
    }

    async fn execute(&self, action: SlaveAction) -> Result<Option<Value>, DeviceError> {
        match action {
            SlaveAction::SetProperty { path, value } => {
                info!("changing property {}", path);
                self.shared.store.set(&["properties", &path], value);
                Ok(None)
            }
            SlaveAction::AddData => {
                info!("creating new data");
                let data_id = self.shared.next_data_id();
                self.shared
                    .store
                    .set(&["data", &data_id], default_data_point());
                Ok(Some(json!(data_id)))
            }
            SlaveAction::RemoveData { data_id } => {
                info!("removing data {}", data_id);
                self.shared.store.remove(&["data", &data_id]);
                Ok(None)
            }
            SlaveAction::ChangeData {
                data_id,
                path,
                value,
            } => {
                info!("changing data {} field {}", data_id, path);
                self.shared.store.set(&["data", &data_id, &path], value);
                Ok(None)
            }
            SlaveAction::NotifyData { data_id } => {
                self.act_notify_data(&data_id);
                Ok(None)
            }
            SlaveAction::AddCommand => {
                info!("creating new command");
                let command_id = self.shared.next_command_id();
                self.shared
                    .store
                    .set(&["commands", &command_id], default_command_point());
                Ok(Some(json!(command_id)))
            }
            SlaveAction::RemoveCommand { command_id } => {
                info!("removing command {}", command_id);
                self.shared.store.remove(&["commands", &command_id]);
                Ok(None)
            }
            SlaveAction::ChangeCommand {
                command_id,
                path,
                value,
            } => {
                info!("changing command {} field {}", command_id, path);
                self.shared
                    .store
                    .set(&["commands", &command_id, &path], value);
                Ok(None)
            }
        }
    }

    fn close(&self) {
        if let Some(server) = lock(&self.server).take() {
            server.close();
        }
    }
}

/// Link-facing side of a slave
struct SlaveHandler {
    shared: Arc<SlaveShared>,
}

impl SlaveHandler {
    /// Decode the stored points matching `asdu` with a fixed cause
    ///
    /// `counter` selects between the counter table view (BinaryCounter
    /// points only) and the station view (everything else). Points that
    /// fail to decode are skipped.
    fn collect_points(&self, asdu: u16, counter: bool, cause: Cause) -> Vec<Data> {
        let mut result = Vec::new();
        for point in point_values(&self.shared.store, "data") {
            let kind = point.get("type").and_then(Value::as_str);
            if (kind == Some("BinaryCounter")) != counter {
                continue;
            }
            if asdu != GLOBAL_ASDU && point.get("asdu").and_then(Value::as_u64) != Some(asdu.into())
            {
                continue;
            }
            match data_from_json(&point) {
                Ok(mut data) => {
                    data.cause = cause;
                    result.push(data);
                }
                Err(err) => debug!(%err, "skipping point"),
            }
        }
        result
    }
}

impl ServerHandler for SlaveHandler {
    fn on_connection(&self, conn: Connection) {
        let shared = self.shared.clone();
        tokio::spawn(connection_loop(shared, conn));
    }

    fn on_interrogate(&self, asdu: u16) -> Vec<Data> {
        info!(asdu, "received interrogate request");
        self.collect_points(asdu, false, Cause::InterrogatedStation)
    }

    fn on_counter_interrogate(&self, asdu: u16, _freeze: FreezeCode) -> Vec<Data> {
        info!(asdu, "received counter interrogate request");
        self.collect_points(asdu, true, Cause::InterrogatedCounter)
    }

    fn on_command(&self, commands: Vec<Command>) -> bool {
        info!(count = commands.len(), "received commands");
        let mut success = true;
        for command in commands {
            let value = value_to_json(&command.value);
            let matched = find_command_point(
                &self.shared.store,
                command.value.kind(),
                command.asdu_address,
                command.io_address,
            );
            match matched {
                Some(command_id) => {
                    self.shared
                        .store
                        .set(&["commands", &command_id, "value"], value);
                }
                None => success = false,
            }
        }
        info!(success, "sending commands success");
        success
    }
}

/// Serve one accepted connection until it closes
async fn connection_loop(shared: Arc<SlaveShared>, conn: Connection) {
    info!(id = conn.meta().id, "new connection accepted");
    bump_connection_count(&shared.store, 1);

    let registration = shared.notify_cbs.register({
        let conn = conn.clone();
        move |data: &Data| {
            let conn = conn.clone();
            let data = data.clone();
            tokio::spawn(async move {
                let _ = conn.notify_data_change(vec![data]).await;
            });
        }
    });

    while conn.receive().await.is_ok() {}

    drop(registration);
    conn.close();
    info!(id = conn.meta().id, "connection closed");
    bump_connection_count(&shared.store, -1);
}

fn bump_connection_count(store: &ObservableStore, delta: i64) {
    store.update(&["connection_count"], |current| {
        let count = current.and_then(Value::as_i64).unwrap_or(0);
        json!(count + delta)
    });
}

/// Id of the first stored command point matching kind and addresses
///
/// A matching point whose `success` flag is unset or false rejects the
/// command, which is signalled by returning no id.
fn find_command_point(store: &ObservableStore, kind: &str, asdu: u16, io: u32) -> Option<String> {
    let points = store.get(&["commands"])?;
    let points = points.as_object()?;
    for (command_id, point) in points {
        if point.get("type").and_then(Value::as_str) != Some(kind) {
            continue;
        }
        if point.get("asdu").and_then(Value::as_u64) != Some(asdu.into()) {
            continue;
        }
        if point.get("io").and_then(Value::as_u64) != Some(io.into()) {
            continue;
        }
        if point.get("success").and_then(Value::as_bool).unwrap_or(false) {
            return Some(command_id.clone());
        }
        return None;
    }
    None
}

fn conf_points<'a>(conf: &'a Value, table: &str) -> impl Iterator<Item = &'a Value> {
    conf.get(table)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn point_values(store: &ObservableStore, table: &str) -> Vec<Value> {
    store
        .get(&[table])
        .and_then(|points| points.as_object().cloned())
        .map(|points| points.into_iter().map(|(_, point)| point).collect())
        .unwrap_or_default()
}

/// Fresh data point with every kind's default payload
fn default_data_point() -> Value {
    json!({
        "type": "Single",
        "asdu": null,
        "io": null,
        "value": {
            "Single": "OFF",
            "Double": "OFF",
            "StepPosition": {"value": 0, "transient": false},
            "Bitstring": "00 00 00 00",
            "Normalized": 0,
            "Scaled": 0,
            "Floating": 0,
            "BinaryCounter": {"value": 0,
                              "sequence": 0,
                              "overflow": false,
                              "adjusted": false,
                              "invalid": false},
        },
        "quality": {"invalid": false,
                    "not_topical": false,
                    "substituted": false,
                    "blocked": false,
                    "overflow": false},
        "time": null,
        "cause": "UNDEFINED",
        "is_test": false,
    })
}

/// Fresh command point restricted to the command-capable kinds
fn default_command_point() -> Value {
    json!({
        "type": "Single",
        "asdu": null,
        "io": null,
        "value": {
            "Single": "OFF",
            "Double": "OFF",
            "Regulating": "LOWER",
            "Normalized": 0,
            "Scaled": 0,
            "Floating": 0,
        },
        "success": true,
    })
}

fn arg<'a>(action: &str, args: &'a [Value], index: usize) -> Result<&'a Value, DeviceError> {
    args.get(index).ok_or_else(|| DeviceError::InvalidArguments {
        action: action.to_string(),
        reason: format!("missing argument {index}"),
    })
}

fn arg_str<'a>(action: &str, args: &'a [Value], index: usize) -> Result<&'a str, DeviceError> {
    arg(action, args, index)?
        .as_str()
        .ok_or_else(|| DeviceError::InvalidArguments {
            action: action.to_string(),
            reason: format!("argument {index} must be a string"),
        })
}

fn lock(server: &Mutex<Option<Server>>) -> std::sync::MutexGuard<'_, Option<Server>> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tele_protocol::{CommandAction, DataValue, SingleValue};

    use super::*;

    fn data_point(kind: &str, asdu: Option<u16>, io: Option<u32>) -> Value {
        let mut point = default_data_point();
        point["type"] = json!(kind);
        point["asdu"] = asdu.map_or(Value::Null, |asdu| json!(asdu));
        point["io"] = io.map_or(Value::Null, |io| json!(io));
        point
    }

    fn command_point(kind: &str, asdu: u16, io: u32, success: bool) -> Value {
        let mut point = default_command_point();
        point["type"] = json!(kind);
        point["asdu"] = json!(asdu);
        point["io"] = json!(io);
        point["success"] = json!(success);
        point
    }

    fn handler(slave: &Slave) -> SlaveHandler {
        SlaveHandler {
            shared: slave.shared.clone(),
        }
    }

    #[tokio::test]
    async fn test_ids_continue_after_configured_points() {
        let conf = json!({
            "data": [data_point("Single", Some(1), Some(1)),
                     data_point("Scaled", Some(1), Some(2))],
            "commands": [command_point("Single", 1, 3, true)],
        });
        let slave = Slave::new(LinkNetwork::new(), &conf);

        assert!(slave.data().get(&["data", "1"]).is_some());
        assert!(slave.data().get(&["data", "2"]).is_some());

        let id = slave.execute(SlaveAction::AddData).await.unwrap();
        assert_eq!(id, Some(json!("3")));
        let id = slave.execute(SlaveAction::AddCommand).await.unwrap();
        assert_eq!(id, Some(json!("2")));
    }

    #[tokio::test]
    async fn test_configured_commands_start_without_value() {
        let conf = json!({"commands": [command_point("Single", 1, 3, true)]});
        let slave = Slave::new(LinkNetwork::new(), &conf);
        assert_eq!(
            slave.data().get(&["commands", "1", "value"]),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_conf_strips_command_values() {
        let conf = json!({
            "data": [data_point("Single", Some(1), Some(1))],
            "commands": [command_point("Scaled", 2, 3, false)],
        });
        let slave = Slave::new(LinkNetwork::new(), &conf);

        let exported = slave.conf();
        assert_eq!(exported["data"], conf["data"]);
        assert_eq!(
            exported["commands"],
            json!([{"type": "Scaled", "asdu": 2, "io": 3, "success": false}])
        );
    }

    #[test]
    fn test_interrogate_filters_by_asdu_and_kind() {
        let conf = json!({
            "data": [data_point("Single", Some(1), Some(10)),
                     data_point("BinaryCounter", Some(1), Some(11)),
                     data_point("Single", Some(2), Some(12)),
                     data_point("Single", None, None)],
        });
        let slave = Slave::new(LinkNetwork::new(), &conf);
        let handler = handler(&slave);

        let result = handler.on_interrogate(1);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].io_address, 10);
        assert_eq!(result[0].cause, Cause::InterrogatedStation);

        // The global address matches every station; the unset point and
        // the counter point still stay out
        let result = handler.on_interrogate(GLOBAL_ASDU);
        let ios: Vec<u32> = result.iter().map(|data| data.io_address).collect();
        assert_eq!(ios, vec![10, 12]);
    }

    #[test]
    fn test_counter_interrogate_serves_only_counters() {
        let conf = json!({
            "data": [data_point("Single", Some(1), Some(10)),
                     data_point("BinaryCounter", Some(1), Some(11))],
        });
        let slave = Slave::new(LinkNetwork::new(), &conf);
        let handler = handler(&slave);

        let result = handler.on_counter_interrogate(GLOBAL_ASDU, FreezeCode::Read);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].io_address, 11);
        assert_eq!(result[0].cause, Cause::InterrogatedCounter);
    }

    fn sample_command(asdu: u16, io: u32) -> Command {
        Command {
            action: CommandAction::Execute,
            value: DataValue::Single(SingleValue::On),
            asdu_address: asdu,
            io_address: io,
            time: None,
            qualifier: 0,
        }
    }

    #[test]
    fn test_command_matching_stores_value() {
        let conf = json!({"commands": [command_point("Single", 1, 3, true)]});
        let slave = Slave::new(LinkNetwork::new(), &conf);
        let handler = handler(&slave);

        assert!(handler.on_command(vec![sample_command(1, 3)]));
        assert_eq!(
            slave.data().get(&["commands", "1", "value"]),
            Some(json!({"Single": "ON"}))
        );
    }

    #[test]
    fn test_command_without_match_fails() {
        let conf = json!({"commands": [command_point("Single", 1, 3, true)]});
        let slave = Slave::new(LinkNetwork::new(), &conf);
        let handler = handler(&slave);

        // Wrong address
        assert!(!handler.on_command(vec![sample_command(1, 4)]));
        // One failing command fails the whole batch
        assert!(!handler.on_command(vec![sample_command(1, 3), sample_command(9, 9)]));
    }

    #[test]
    fn test_command_with_success_flag_unset_fails() {
        let conf = json!({"commands": [command_point("Single", 1, 3, false)]});
        let slave = Slave::new(LinkNetwork::new(), &conf);
        let handler = handler(&slave);

        assert!(!handler.on_command(vec![sample_command(1, 3)]));
        assert_eq!(
            slave.data().get(&["commands", "1", "value"]),
            Some(Value::Null)
        );
    }

    #[tokio::test]
    async fn test_notify_data_skips_unset_addresses() {
        let slave = Slave::new(LinkNetwork::new(), &json!({}));
        let data_id = slave.execute(SlaveAction::AddData).await.unwrap();
        assert_eq!(data_id, Some(json!("1")));

        let seen = Arc::new(StdMutex::new(0usize));
        let seen_cb = seen.clone();
        let _reg = slave.shared.notify_cbs.register(move |_: &Data| {
            *seen_cb.lock().unwrap() += 1;
        });

        // Default points carry no addresses yet
        slave
            .execute(SlaveAction::NotifyData {
                data_id: "1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), 0);

        for (path, value) in [("asdu", json!(1)), ("io", json!(2))] {
            slave
                .execute(SlaveAction::ChangeData {
                    data_id: "1".to_string(),
                    path: path.to_string(),
                    value,
                })
                .await
                .unwrap();
        }
        slave
            .execute(SlaveAction::NotifyData {
                data_id: "1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_data_deletes_point() {
        let slave = Slave::new(LinkNetwork::new(), &json!({}));
        slave.execute(SlaveAction::AddData).await.unwrap();

        slave
            .execute(SlaveAction::RemoveData {
                data_id: "1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(slave.data().get(&["data", "1"]), None);
    }

    #[test]
    fn test_from_request_rejects_unknown_action() {
        let err = SlaveAction::from_request("explode", &[]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidAction(name) if name == "explode"));
    }

    #[test]
    fn test_from_request_decodes_actions() {
        assert_eq!(
            SlaveAction::from_request("add_data", &[]).unwrap(),
            SlaveAction::AddData
        );
        assert_eq!(
            SlaveAction::from_request("change_command", &[json!("2"), json!("io"), json!(7)])
                .unwrap(),
            SlaveAction::ChangeCommand {
                command_id: "2".to_string(),
                path: "io".to_string(),
                value: json!(7),
            }
        );
    }
}
