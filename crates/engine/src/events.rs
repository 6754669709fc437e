//! Engine event stream — broadcast to subscribers and optionally
//! mirrored to an NDJSON telemetry file.

use serde::Serialize;

use visor_domain::scope::Scope;
use visor_domain::trace::RoutingRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "check:start")]
    CheckStart { check: String, scope: Scope, attempt: u32 },
    #[serde(rename = "check:success")]
    CheckSuccess {
        check: String,
        scope: Scope,
        duration_ms: u64,
    },
    #[serde(rename = "check:fail")]
    CheckFail {
        check: String,
        scope: Scope,
        duration_ms: u64,
        issue_count: usize,
    },
    #[serde(rename = "routing:action")]
    RoutingAction {
        #[serde(flatten)]
        record: RoutingRecord,
    },
    #[serde(rename = "routing:loop")]
    RoutingLoop { scope: Scope, depth: u32 },
    #[serde(rename = "log")]
    Log { message: String },
    #[serde(rename = "done")]
    Done {
        success_count: u64,
        failure_count: u64,
        duration_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_domain::trace::RouteAction;

    #[test]
    fn events_serialize_with_type_tags() {
        let e = EngineEvent::CheckStart {
            check: "lint".into(),
            scope: Scope::root(),
            attempt: 1,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "check:start");
        assert_eq!(v["scope"], "root");

        let r = EngineEvent::RoutingAction {
            record: RoutingRecord::new("a", RouteAction::Retry, "transient", 1, Scope::root()),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "routing:action");
        assert_eq!(v["action"], "retry");
    }
}
