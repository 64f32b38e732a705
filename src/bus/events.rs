//! Built-in event kinds.

use serde_json::json;

use super::EventBus;

pub const PERMISSION_ASKED: &str = "permission.asked";
pub const PERMISSION_REPLIED: &str = "permission.replied";
pub const MESSAGE_UPDATED: &str = "message.updated";
pub const MESSAGE_PART_UPDATED: &str = "message.part.updated";
pub const SESSION_STATUS: &str = "session.status";
pub const SESSION_ERROR: &str = "session.error";

pub(super) fn define_builtin(bus: &EventBus) {
    bus.define(
        PERMISSION_ASKED,
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "session_id": { "type": "string" },
                "permission": { "type": "string" },
                "patterns": { "type": "array", "items": { "type": "string" } },
                "always": { "type": "array", "items": { "type": "string" } },
                "metadata": { "type": "object" }
            },
            "required": ["id", "session_id", "permission", "patterns"]
        }),
    );
    bus.define(
        PERMISSION_REPLIED,
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "request_id": { "type": "string" },
                "reply": { "type": "string", "enum": ["once", "always", "reject"] }
            },
            "required": ["session_id", "request_id", "reply"]
        }),
    );
    bus.define(
        MESSAGE_UPDATED,
        json!({
            "type": "object",
            "properties": { "info": { "type": "object" } },
            "required": ["info"]
        }),
    );
    bus.define(
        MESSAGE_PART_UPDATED,
        json!({
            "type": "object",
            "properties": {
                "part": { "type": "object" },
                "delta": { "type": "string" }
            },
            "required": ["part"]
        }),
    );
    bus.define(
        SESSION_STATUS,
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "status": { "type": "object" }
            },
            "required": ["session_id", "status"]
        }),
    );
    bus.define(
        SESSION_ERROR,
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "error": { "type": "object" }
            },
            "required": ["error"]
        }),
    );
}
