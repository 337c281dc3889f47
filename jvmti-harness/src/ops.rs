// Operation schema definitions
//
// Every op drives one core component on the harness thread.

use crate::protocol::Op;
use serde_json::{json, Value};

fn op(name: &str, description: &str, input_schema: Value) -> Op {
    Op {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn location_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "method": { "type": "integer", "description": "Method ID" },
            "location": { "type": "integer", "description": "Bytecode index (0..=65535)" }
        },
        "required": ["method", "location"]
    })
}

fn monitor_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "monitor": { "type": "integer", "description": "Handle from monitor.create" }
        },
        "required": ["monitor"]
    })
}

fn object_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "object": { "type": "integer", "description": "Handle from object.new" }
        },
        "required": ["object"]
    })
}

pub fn get_ops() -> Vec<Op> {
    vec![
        op(
            "breakpoint.set",
            "Set a breakpoint and invalidate the method's compiled code",
            location_schema(),
        ),
        op("breakpoint.clear", "Clear a breakpoint", location_schema()),
        op(
            "breakpoint.list",
            "List breakpoints, optionally only those in one method",
            json!({
                "type": "object",
                "properties": {
                    "method": { "type": "integer", "description": "Restrict to this method" }
                }
            }),
        ),
        op(
            "breakpoint.trap",
            "Simulate instrumented code reaching a trap",
            json!({
                "type": "object",
                "properties": {
                    "method": { "type": "integer" },
                    "location": { "type": "integer" },
                    "single_step": { "type": "boolean", "default": false },
                    "also_break": {
                        "type": "boolean",
                        "description": "Single-step trap at a location that also has a breakpoint",
                        "default": false
                    }
                },
                "required": ["method", "location"]
            }),
        ),
        op(
            "monitor.create",
            "Create a raw monitor",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" }
                },
                "required": ["name"]
            }),
        ),
        op("monitor.enter", "Enter a raw monitor (re-entrant)", monitor_schema()),
        op("monitor.exit", "Exit a raw monitor", monitor_schema()),
        op("monitor.notify", "Wake one waiter", monitor_schema()),
        op("monitor.notify_all", "Wake every waiter", monitor_schema()),
        op(
            "monitor.wait",
            "Wait on an owned raw monitor. Blocks the harness, so a positive timeout is required.",
            json!({
                "type": "object",
                "properties": {
                    "monitor": { "type": "integer" },
                    "millis": { "type": "integer", "minimum": 1 }
                },
                "required": ["monitor", "millis"]
            }),
        ),
        op("monitor.destroy", "Destroy a raw monitor", monitor_schema()),
        op(
            "object.new",
            "Allocate a heap object",
            json!({
                "type": "object",
                "properties": {
                    "class": { "type": "integer", "default": 0 }
                }
            }),
        ),
        op(
            "object.release",
            "Drop the harness's reference so the object can be reclaimed",
            object_schema(),
        ),
        op(
            "tag.set",
            "Tag an object; 0 removes the tag",
            json!({
                "type": "object",
                "properties": {
                    "object": { "type": "integer" },
                    "tag": { "type": "integer" }
                },
                "required": ["object", "tag"]
            }),
        ),
        op("tag.get", "Get an object's tag (0 if untagged)", object_schema()),
        op(
            "tag.query",
            "Find live objects carrying any of the given tags",
            json!({
                "type": "object",
                "properties": {
                    "tags": { "type": "array", "items": { "type": "integer" } }
                },
                "required": ["tags"]
            }),
        ),
        op(
            "exception.raise",
            "Analyze a thrown exception against a scripted stack (innermost frame first)",
            json!({
                "type": "object",
                "properties": {
                    "exception": { "type": "integer" },
                    "class": { "type": "integer" },
                    "superclasses": {
                        "type": "object",
                        "description": "Class ID to superclass ID, merged into the harness hierarchy"
                    },
                    "frames": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "method": { "type": "integer" },
                                "index": { "type": "integer" },
                                "origin": { "type": "string", "enum": ["bootstrap", "application"] },
                                "handlers": { "type": "array" }
                            },
                            "required": ["method", "index", "origin"]
                        }
                    }
                },
                "required": ["exception", "class", "frames"]
            }),
        ),
        op(
            "events.enable",
            "Enable or disable event kinds",
            json!({
                "type": "object",
                "properties": {
                    "kinds": {
                        "type": "array",
                        "items": {
                            "type": "string",
                            "enum": [
                                "single_step", "breakpoint", "frame_pop", "exception",
                                "exception_catch", "method_exit", "field_access",
                                "field_modification"
                            ]
                        }
                    },
                    "enabled": { "type": "boolean", "default": true }
                },
                "required": ["kinds"]
            }),
        ),
        op(
            "events.drain",
            "Take every queued event, with the size of its wire packet",
            json!({
                "type": "object",
                "properties": {}
            }),
        ),
    ]
}
