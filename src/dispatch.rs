//! Envelope construction and the inbound message router: hello messages
//! update the node table, everything else goes through the channel table.

use std::net::SocketAddr;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::debug;

use crate::node::{Iid, NodeData, Pid};
use crate::Discover;

/// Build the standard envelope: `{event, pid, iid, hostName, data}`.
pub fn build_envelope(pid: Pid, iid: Iid, hostname: &str, event: &str, data: Value) -> Value {
    json!({
        "event": event,
        "pid": pid.to_string(),
        "iid": iid.to_string(),
        "hostName": hostname,
        "data": data,
    })
}

/// Build the data object carried by a hello.
pub fn build_hello_data(is_master: bool, is_master_eligible: bool, weight: f64, address: &str, advertisement: Option<&Value>) -> Value {
    let mut data = json!({
        "isMaster": is_master,
        "isMasterEligible": is_master_eligible,
        "weight": weight,
        "address": address,
    });
    if let Some(adv) = advertisement {
        data["advertisement"] = adv.clone();
    }
    data
}

/// Parse and route one inbound datagram. Drops silently on any malformed or
/// filtered input — the wire is shared and adversarially noisy, per the
/// protocol's error-handling policy.
pub async fn handle_datagram(discover: &Discover, source: SocketAddr, bytes: &[u8]) {
    let json: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(_) => return,
    };

    let Some(pid_str) = json.get("pid").and_then(Value::as_str) else {
        return;
    };
    let Ok(pid_uuid) = pid_str.parse::<uuid::Uuid>() else {
        return;
    };
    let pid = Pid(pid_uuid);

    let Some(iid_str) = json.get("iid").and_then(Value::as_str) else {
        return;
    };
    let Ok(iid_uuid) = iid_str.parse::<uuid::Uuid>() else {
        return;
    };
    let iid = Iid(iid_uuid);

    {
        let options = discover.options.lock().await;
        if options.ignore_process && pid == discover.pid {
            return;
        }
        if options.ignore_instance && iid == discover.iid {
            return;
        }
    }

    let Some(event) = json.get("event").and_then(Value::as_str) else {
        return;
    };

    if event == "hello" {
        handle_hello(discover, pid, iid, source, &json).await;
    } else {
        let mut channels = discover.channels.lock().await;
        channels.dispatch(discover, event, &json);
    }
}

async fn handle_hello(discover: &Discover, pid: Pid, iid: Iid, source: SocketAddr, json: &Value) {
    let Some(data) = json.get("data").filter(|d| d.is_object()) else {
        return;
    };
    let Some(hostname) = json.get("hostName").and_then(Value::as_str) else {
        return;
    };
    let Some(is_master) = data.get("isMaster").and_then(Value::as_bool) else {
        return;
    };
    let Some(is_master_eligible) = data.get("isMasterEligible").and_then(Value::as_bool) else {
        return;
    };
    let Some(weight) = data.get("weight").and_then(Value::as_f64) else {
        return;
    };
    let Some(address) = data.get("address").and_then(Value::as_str) else {
        return;
    };
    let advertisement = data.get("advertisement").cloned();

    let node_data = NodeData {
        is_master,
        is_master_eligible,
        weight,
        address: address.to_string(),
        advertisement,
    };

    let outcome = {
        let mut state = discover.state.lock().await;
        let outcome =
            state
                .nodes
                .upsert(pid, iid, source.ip(), source.port(), hostname, node_data, Instant::now());

        if outcome.is_new {
            if let Some(cb) = discover.observers.lock().await.added.clone() {
                cb(discover, &outcome.node);
            }
        }

        let became_master = outcome.node.data.is_master && (outcome.is_new || !outcome.was_master_before);
        if became_master {
            if let Some(cb) = discover.observers.lock().await.master.clone() {
                cb(discover, &outcome.node);
            }
        }

        outcome
    };

    debug!(pid = %pid, iid = %iid, is_new = outcome.is_new, "hello received");

    if let Some(cb) = discover.observers.lock().await.hello_received.clone() {
        cb(discover, &outcome.node);
    }
}
