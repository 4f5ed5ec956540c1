//! Controlling station simulation
//!
//! Connects to a remote slave and keeps a rolling history of every data
//! change it sees, newest first. Actions either tweak the connection
//! properties or drive requests over the live link; requests issued while
//! the link is down are logged and dropped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{info, warn};

use tele_protocol::{Connection, FreezeCode, LinkNetwork};

use crate::codec::{command_from_json, data_to_json};
use crate::device::{Device, DeviceProperties};
use crate::error::DeviceError;
use crate::store::ObservableStore;

/// Upper bound on the retained data change history
const HISTORY_LIMIT: usize = 100;

/// Actions accepted by a [`Master`]
#[derive(Debug, Clone, PartialEq)]
pub enum MasterAction {
    /// Change one connection property
    SetProperty { path: String, value: Value },
    /// Station interrogation of `asdu` (0xFFFF for all stations)
    Interrogate { asdu: u16 },
    /// Counter interrogation of `asdu`
    CounterInterrogate { asdu: u16, freeze: FreezeCode },
    /// Send a single encoded command
    SendCommand { command: Value },
}

impl MasterAction {
    /// Decode a string-keyed action request from a front end
    pub fn from_request(name: &str, args: &[Value]) -> Result<Self, DeviceError> {
        match name {
            "set_property" => Ok(Self::SetProperty {
                path: arg_str(name, args, 0)?.to_string(),
                value: arg(name, args, 1)?.clone(),
            }),
            "interrogate" => Ok(Self::Interrogate {
                asdu: arg_asdu(name, args, 0)?,
            }),
            "counter_interrogate" => Ok(Self::CounterInterrogate {
                asdu: arg_asdu(name, args, 0)?,
                freeze: serde_json::from_value(arg(name, args, 1)?.clone()).map_err(|err| {
                    DeviceError::InvalidArguments {
                        action: name.to_string(),
                        reason: err.to_string(),
                    }
                })?,
            }),
            "send_command" => Ok(Self::SendCommand {
                command: arg(name, args, 0)?.clone(),
            }),
            _ => Err(DeviceError::InvalidAction(name.to_string())),
        }
    }
}

/// Controlling station endpoint with a rolling data history
pub struct Master {
    network: LinkNetwork,
    store: Arc<ObservableStore>,
    conn: Mutex<Option<Connection>>,
}

impl Master {
    /// Create a master from a stored configuration
    pub fn new(network: LinkNetwork, conf: &Value) -> Self {
        let properties = DeviceProperties::from_value(conf.get("properties"));
        let store = ObservableStore::new(json!({
            "properties": properties.to_json(),
            "data": [],
        }));
        Self {
            network,
            store: Arc::new(store),
            conn: Mutex::new(None),
        }
    }

    fn current_conn(&self) -> Option<Connection> {
        lock(&self.conn).clone().filter(Connection::is_open)
    }

    async fn act_interrogate(&self, asdu: u16) -> Result<Option<Value>, DeviceError> {
        let Some(conn) = self.current_conn() else {
            warn!("interrogate failed, not connected");
            return Ok(None);
        };

        info!(asdu, "sending interrogate");
        let data = conn.interrogate(asdu).await?;
        info!(count = data.len(), "received interrogate result");
        add_history(&self.store, &data);
        Ok(None)
    }

    async fn act_counter_interrogate(
        &self,
        asdu: u16,
        freeze: FreezeCode,
    ) -> Result<Option<Value>, DeviceError> {
        let Some(conn) = self.current_conn() else {
            warn!("counter interrogate failed, not connected");
            return Ok(None);
        };

        info!(asdu, "sending counter interrogate");
        let data = conn.counter_interrogate(asdu, freeze).await?;
        info!(count = data.len(), "received counter interrogate result");
        add_history(&self.store, &data);
        Ok(None)
    }

    async fn act_send_command(&self, command: &Value) -> Result<Option<Value>, DeviceError> {
        let Some(conn) = self.current_conn() else {
            warn!("command failed, not connected");
            return Ok(None);
        };
        let command = command_from_json(command)?;

        info!("sending command");
        let result = conn.send_command(command).await?;
        info!(success = result, "received command result");
        Ok(Some(json!(result)))
    }
}

impl Device for Master {
    type Action = MasterAction;
    type Handle = Connection;

    fn data(&self) -> &Arc<ObservableStore> {
        &self.store
    }

    fn conf(&self) -> Value {
        json!({"properties": self.store.get(&["properties"])})
    }

    async fn start(&self) -> Result<Connection, DeviceError> {
        let properties = DeviceProperties::from_value(self.store.get(&["properties"]).as_ref());
        let conn = self
            .network
            .connect(properties.address(), properties.options())
            .await?;
        *lock(&self.conn) = Some(conn.clone());

        let store = self.store.clone();
        let loop_conn = conn.clone();
        tokio::spawn(async move {
            while let Ok(data) = loop_conn.receive().await {
                info!(count = data.len(), "received data changes");
                add_history(&store, &data);
            }
            loop_conn.close();
        });

        Ok(conn)
    }

    async fn execute(&self, action: MasterAction) -> Result<Option<Value>, DeviceError> {
        match action {
            MasterAction::SetProperty { path, value } => {
                info!("changing property {}", path);
                self.store.set(&["properties", &path], value);
                Ok(None)
            }
            MasterAction::Interrogate { asdu } => self.act_interrogate(asdu).await,
            MasterAction::CounterInterrogate { asdu, freeze } => {
                self.act_counter_interrogate(asdu, freeze).await
            }
            MasterAction::SendCommand { command } => self.act_send_command(&command).await,
        }
    }

    fn close(&self) {
        if let Some(conn) = lock(&self.conn).take() {
            conn.close();
        }
    }
}

/// Prepend `data` to the rolling history, newest entry first
fn add_history(store: &ObservableStore, data: &[tele_protocol::Data]) {
    if data.is_empty() {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);

    store.update(&["data"], |current| {
        let mut history: Vec<Value> = data
            .iter()
            .rev()
            .map(|item| {
                let mut entry = data_to_json(item);
                if let Value::Object(map) = &mut entry {
                    map.insert("timestamp".to_string(), json!(now));
                }
                entry
            })
            .collect();
        if let Some(existing) = current.and_then(Value::as_array) {
            history.extend(existing.iter().cloned());
        }
        history.truncate(HISTORY_LIMIT);
        Value::Array(history)
    });
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

fn arg_asdu(action: &str, args: &[Value], index: usize) -> Result<u16, DeviceError> {
    arg(action, args, index)?
        .as_u64()
        .and_then(|raw| u16::try_from(raw).ok())
        .ok_or_else(|| DeviceError::InvalidArguments {
            action: action.to_string(),
            reason: format!("argument {index} must be a station address"),
        })
}

fn lock(conn: &Mutex<Option<Connection>>) -> std::sync::MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tele_protocol::{Cause, Data, DataValue, ScaledValue, SingleValue};

    use super::*;

    fn sample_data(io: u32) -> Data {
        Data {
            value: DataValue::Scaled(ScaledValue(io as i16)),
            quality: None,
            time: None,
            asdu_address: 1,
            io_address: io,
            cause: Cause::Spontaneous,
            is_test: false,
        }
    }

    #[test]
    fn test_history_is_newest_first_and_capped() {
        let store = ObservableStore::new(json!({"data": []}));

        let batch: Vec<Data> = (0..60).map(sample_data).collect();
        add_history(&store, &batch);
        let batch: Vec<Data> = (60..120).map(sample_data).collect();
        add_history(&store, &batch);

        let history = store.get(&["data"]).unwrap();
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        // The last entry of the newest batch leads the history
        assert_eq!(history[0]["io"], json!(119));
        assert_eq!(history[59]["io"], json!(60));
        assert_eq!(history[60]["io"], json!(59));
        assert!(history.iter().all(|entry| entry["timestamp"].is_number()));
    }

    #[test]
    fn test_empty_batch_leaves_history_untouched() {
        let store = ObservableStore::new(json!({"data": [{"io": 1}]}));
        add_history(&store, &[]);
        assert_eq!(store.get(&["data"]), Some(json!([{"io": 1}])));
    }

    #[test]
    fn test_from_request_rejects_unknown_action() {
        let err = MasterAction::from_request("reboot", &[]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidAction(name) if name == "reboot"));
    }

    #[test]
    fn test_from_request_decodes_actions() {
        assert_eq!(
            MasterAction::from_request("interrogate", &[json!(0xFFFF)]).unwrap(),
            MasterAction::Interrogate { asdu: 0xFFFF }
        );
        assert_eq!(
            MasterAction::from_request("counter_interrogate", &[json!(5), json!("FREEZE")])
                .unwrap(),
            MasterAction::CounterInterrogate {
                asdu: 5,
                freeze: FreezeCode::Freeze,
            }
        );
        assert_eq!(
            MasterAction::from_request("set_property", &[json!("port"), json!(2405)]).unwrap(),
            MasterAction::SetProperty {
                path: "port".to_string(),
                value: json!(2405),
            }
        );
    }

    #[test]
    fn test_from_request_rejects_bad_arguments() {
        let err = MasterAction::from_request("interrogate", &[json!("not a number")]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArguments { .. }));

        let err = MasterAction::from_request("set_property", &[]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_requests_without_connection_are_dropped() {
        let master = Master::new(LinkNetwork::new(), &json!({}));

        let result = master
            .execute(MasterAction::Interrogate { asdu: 1 })
            .await
            .unwrap();
        assert_eq!(result, None);

        let command = json!({
            "type": "Single",
            "asdu": 1,
            "io": 2,
            "action": "EXECUTE",
            "value": {"Single": "ON"},
        });
        let result = master
            .execute(MasterAction::SendCommand { command })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(master.data().get(&["data"]), Some(json!([])));
    }

    #[tokio::test]
    async fn test_set_property_updates_store_and_conf() {
        let master = Master::new(LinkNetwork::new(), &json!({}));
        master
            .execute(MasterAction::SetProperty {
                path: "host".to_string(),
                value: json!("192.168.1.9"),
            })
            .await
            .unwrap();

        assert_eq!(
            master.data().get(&["properties", "host"]),
            Some(json!("192.168.1.9"))
        );
        assert_eq!(master.conf()["properties"]["host"], json!("192.168.1.9"));
    }
}
