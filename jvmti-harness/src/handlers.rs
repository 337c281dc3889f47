// Request handlers
//
// Handles initialize, ops/list, and op execution against the session

use crate::ops;
use crate::protocol::*;
use crate::session::{FrameSpec, HarnessSession, ScriptedStack};
use jvmti_core::breakpoints::BreakpointId;
use jvmti_core::types::{ClassId, MethodId, ObjectId};
use jvmti_core::wire::{encode_event_packet, suspend_policy};
use jvmti_core::{EventType, JvmtiError, RawMonitorId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a single op
enum OpError {
    /// Reported to the client as an op result with `isError`
    Core(JvmtiError),
    /// Malformed arguments, reported as a JSON-RPC error
    Rpc(JsonRpcError),
}

impl From<JvmtiError> for OpError {
    fn from(error: JvmtiError) -> Self {
        OpError::Core(error)
    }
}

impl From<JsonRpcError> for OpError {
    fn from(error: JsonRpcError) -> Self {
        OpError::Rpc(error)
    }
}

type OpResult = Result<Value, OpError>;

fn parse<T: DeserializeOwned>(op: &str, args: Value) -> Result<T, JsonRpcError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid arguments for {}: {}", op, e)))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError {
        code: INVALID_REQUEST,
        message: format!("Failed to serialize result: {}", e),
        data: None,
    })
}

#[derive(Deserialize)]
struct LocationArgs {
    method: MethodId,
    location: u32,
}

#[derive(Deserialize)]
struct ListArgs {
    method: Option<MethodId>,
}

#[derive(Deserialize)]
struct TrapArgs {
    method: MethodId,
    location: u32,
    #[serde(default)]
    single_step: bool,
    #[serde(default)]
    also_break: bool,
}

#[derive(Deserialize)]
struct CreateMonitorArgs {
    name: String,
}

#[derive(Deserialize)]
struct MonitorArgs {
    monitor: u64,
}

#[derive(Deserialize)]
struct WaitArgs {
    monitor: u64,
    millis: i64,
}

#[derive(Deserialize)]
struct NewObjectArgs {
    #[serde(default)]
    class: ClassId,
}

#[derive(Deserialize)]
struct ObjectArgs {
    object: ObjectId,
}

#[derive(Deserialize)]
struct SetTagArgs {
    object: ObjectId,
    tag: i64,
}

#[derive(Deserialize)]
struct QueryArgs {
    tags: Vec<i64>,
}

#[derive(Deserialize)]
struct RaiseArgs {
    exception: ObjectId,
    class: ClassId,
    #[serde(default)]
    superclasses: HashMap<String, ClassId>,
    frames: Vec<FrameSpec>,
}

#[derive(Deserialize)]
struct EnableArgs {
    kinds: Vec<EventType>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

pub struct RequestHandler {
    session: Mutex<HarnessSession>,
}

impl RequestHandler {
    pub fn new(session: HarnessSession) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != JSONRPC_VERSION {
            warn!("Rejecting request with jsonrpc version {:?}", request.jsonrpc);
            return JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: request.id,
                result: None,
                error: Some(JsonRpcError {
                    code: INVALID_REQUEST,
                    message: format!("Unsupported jsonrpc version: {}", request.jsonrpc),
                    data: None,
                }),
            };
        }

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params),
            "ops/list" => self.handle_list_ops(),
            "ops/call" => self.handle_call_op(request.params).await,
            _ => Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", request.method),
                data: None,
            }),
        };

        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: request.id,
                result: Some(value),
                error: None,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: request.id,
                result: None,
                error: Some(error),
            },
        }
    }

    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        if notification.jsonrpc != JSONRPC_VERSION {
            warn!("Ignoring notification with jsonrpc version {:?}", notification.jsonrpc);
            return;
        }
        match notification.method.as_str() {
            "notifications/initialized" => {
                info!("Client initialized");
            }
            "notifications/cancelled" => {
                debug!("Request cancelled: {:?}", notification.params);
            }
            _ => {
                warn!("Unknown notification: {}", notification.method);
            }
        }
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e)))?;
        info!(
            "Initializing for client {:?} (protocol {:?})",
            params.client_info, params.protocol_version
        );

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                ops: OpsCapability {},
            },
            server_info: ServerInfo {
                name: "jvmti-harness".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Drives the JVMTI instrumentation core in-process. \
                Enable event kinds with events.enable, set breakpoints and simulate \
                traps with breakpoint.*, then collect results with events.drain."
                    .to_string(),
            ),
        };

        to_value(result)
    }

    fn handle_list_ops(&self) -> Result<Value, JsonRpcError> {
        to_value(ListOpsResult { ops: ops::get_ops() })
    }

    async fn handle_call_op(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let call: CallOpParams = serde_json::from_value(params.unwrap_or(json!({})))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid op call params: {}", e)))?;

        let mut session = self.session.lock().await;
        let session = &mut *session;
        let args = call.arguments;

        // Route to the op implementation by name
        let result = match call.name.as_str() {
            "breakpoint.set" => op_breakpoint_set(session, args),
            "breakpoint.clear" => op_breakpoint_clear(session, args),
            "breakpoint.list" => op_breakpoint_list(session, args),
            "breakpoint.trap" => op_breakpoint_trap(session, args),
            "monitor.create" => op_monitor_create(session, args),
            "monitor.enter" => op_monitor(session, "monitor.enter", args, |m, id| m.enter(id)),
            "monitor.exit" => op_monitor(session, "monitor.exit", args, |m, id| m.exit(id)),
            "monitor.notify" => op_monitor(session, "monitor.notify", args, |m, id| m.notify(id)),
            "monitor.notify_all" => {
                op_monitor(session, "monitor.notify_all", args, |m, id| m.notify_all(id))
            }
            "monitor.destroy" => op_monitor(session, "monitor.destroy", args, |m, id| m.destroy(id)),
            "monitor.wait" => op_monitor_wait(session, args),
            "object.new" => op_object_new(session, args),
            "object.release" => op_object_release(session, args),
            "tag.set" => op_tag_set(session, args),
            "tag.get" => op_tag_get(session, args),
            "tag.query" => op_tag_query(session, args),
            "exception.raise" => op_exception_raise(session, args),
            "events.enable" => op_events_enable(session, args),
            "events.drain" => op_events_drain(session),
            _ => Err(OpError::Rpc(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Unknown op: {}", call.name),
                data: None,
            })),
        };

        match result {
            Ok(content) => to_value(CallOpResult {
                content,
                is_error: None,
            }),
            Err(OpError::Core(error)) => {
                debug!("Op {} failed: {}", call.name, error);
                to_value(CallOpResult {
                    content: json!({ "error": error.name(), "code": error.code() }),
                    is_error: Some(true),
                })
            }
            Err(OpError::Rpc(error)) => Err(error),
        }
    }
}

fn op_breakpoint_set(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: LocationArgs = parse("breakpoint.set", args)?;
    let id = session.env.breakpoints().set(args.method, args.location)?;
    Ok(json!({
        "id": id.raw(),
        "recompiled": session.code.invalidated().contains(&args.method),
    }))
}

fn op_breakpoint_clear(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: LocationArgs = parse("breakpoint.clear", args)?;
    session.env.breakpoints().clear(args.method, args.location)?;
    Ok(json!({ "cleared": true }))
}

fn op_breakpoint_list(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: ListArgs = parse("breakpoint.list", args)?;
    let registry = session.env.breakpoints();
    let ids: Vec<BreakpointId> = match args.method {
        Some(method) => registry.breakpoints(method).to_vec(),
        None => registry.all(),
    };
    let locations: Vec<Value> = ids
        .iter()
        .map(|id| json!({ "id": id.raw(), "method": id.method(), "location": id.location() }))
        .collect();
    Ok(json!({ "count": locations.len(), "breakpoints": locations }))
}

fn op_breakpoint_trap(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: TrapArgs = parse("breakpoint.trap", args)?;
    let mut id = BreakpointId::new(args.method, args.location)?;
    if args.single_step || args.also_break {
        id = id.stepping(args.also_break);
    }
    session.env.breakpoints().event(id.raw());
    Ok(json!({ "encoded": id.raw() }))
}

fn op_monitor_create(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: CreateMonitorArgs = parse("monitor.create", args)?;
    let id = session.env.monitors().create(&args.name)?;
    Ok(json!({ "monitor": id.raw() }))
}

fn op_monitor<F>(session: &mut HarnessSession, op: &str, args: Value, action: F) -> OpResult
where
    F: FnOnce(&jvmti_core::MonitorTable, RawMonitorId) -> Result<(), JvmtiError>,
{
    let args: MonitorArgs = parse(op, args)?;
    let id = RawMonitorId::from_raw(args.monitor);
    let monitors = session.env.monitors();
    action(monitors, id)?;

    // Destroyed handles have no usage to report
    match monitors.usage(id) {
        Ok(usage) => Ok(to_value(usage)?),
        Err(_) => Ok(json!({ "destroyed": true })),
    }
}

fn op_monitor_wait(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: WaitArgs = parse("monitor.wait", args)?;
    if args.millis <= 0 {
        return Err(JsonRpcError::invalid_params(
            "monitor.wait needs a positive timeout: nothing can notify the harness thread",
        )
        .into());
    }
    let id = RawMonitorId::from_raw(args.monitor);
    session.env.monitors().wait(id, args.millis)?;
    Ok(to_value(session.env.monitors().usage(id)?)?)
}

fn op_object_new(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: NewObjectArgs = parse("object.new", args)?;
    let object = session.allocate(args.class);
    Ok(json!({ "object": object.id, "class": object.class }))
}

fn op_object_release(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: ObjectArgs = parse("object.release", args)?;
    if !session.release(args.object) {
        return Err(JvmtiError::IllegalArgument(format!("unknown object {}", args.object)).into());
    }
    Ok(json!({ "released": args.object }))
}

fn lookup(session: &HarnessSession, id: ObjectId) -> Result<std::sync::Arc<crate::session::HeapObject>, OpError> {
    session
        .object(id)
        .cloned()
        .ok_or_else(|| JvmtiError::IllegalArgument(format!("unknown object {}", id)).into())
}

fn op_tag_set(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: SetTagArgs = parse("tag.set", args)?;
    let object = lookup(session, args.object)?;
    session.env.tags().set_tag(&object, args.tag);
    Ok(json!({ "object": args.object, "tag": args.tag }))
}

fn op_tag_get(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: ObjectArgs = parse("tag.get", args)?;
    let object = lookup(session, args.object)?;
    Ok(json!({ "object": args.object, "tag": session.env.tags().get_tag(&object) }))
}

fn op_tag_query(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: QueryArgs = parse("tag.query", args)?;
    let mut found = session.env.tags().objects_with_tags(&args.tags)?;
    found.sort_by_key(|(object, _)| object.id);
    let objects: Vec<Value> = found
        .iter()
        .map(|(object, tag)| json!({ "object": object.id, "tag": tag }))
        .collect();
    Ok(json!({ "count": objects.len(), "objects": objects }))
}

fn op_exception_raise(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: RaiseArgs = parse("exception.raise", args)?;
    for (class, superclass) in &args.superclasses {
        let class: ClassId = class
            .parse()
            .map_err(|_| JsonRpcError::invalid_params(format!("Invalid class id: {}", class)))?;
        session.hierarchy.declare(class, *superclass);
    }

    let report = session
        .env
        .exceptions()
        .raise(&ScriptedStack(&args.frames), args.exception, args.class);
    Ok(json!({
        "report": to_value(report)?,
        "instrumented": to_value(session.code.instrumented())?,
    }))
}

fn op_events_enable(session: &mut HarnessSession, args: Value) -> OpResult {
    let args: EnableArgs = parse("events.enable", args)?;
    for kind in &args.kinds {
        session.sink.set_enabled(*kind, args.enabled);
    }
    Ok(json!({ "enabled": to_value(session.sink.enabled())? }))
}

fn op_events_drain(session: &mut HarnessSession) -> OpResult {
    let events = session.receiver.drain();
    let packet_id = session.next_packet_id();
    let packet = encode_event_packet(packet_id, suspend_policy::NONE, &events);
    Ok(json!({
        "count": events.len(),
        "events": to_value(&events)?,
        "packet_bytes": packet.len(),
    }))
}
