//! Sleeper CRD
//!
//! A Sleeper waits `sleepFor` seconds after it is first seen, then wakes up
//! and reports `wakeupMessage` in its status.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Annotation naming the status field that signals readiness of a Sleeper
pub const READY_FIELD_PATH_ANNOTATION: &str = "kindstore.microscaler.io/ready-when-field-path";

/// Annotation naming the value of that field once ready
pub const READY_FIELD_VALUE_ANNOTATION: &str = "kindstore.microscaler.io/ready-when-field-value";

/// Desired behaviour of a Sleeper
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kindstore.microscaler.io",
    version = "v1",
    kind = "Sleeper",
    namespaced,
    status = "SleeperStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SleeperSpec {
    /// Seconds to sleep before waking up
    pub sleep_for: u64,

    /// Message reported in status on wake up
    pub wakeup_message: String,
}

/// Observed state of a Sleeper, written by the controller
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SleeperStatus {
    /// Current state
    pub state: SleeperState,

    /// Wake up message, or the error that stopped the sleeper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When `state` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<chrono::DateTime<chrono::Utc>>,
}

/// Sleeper lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum SleeperState {
    /// Not yet picked up by the controller
    #[default]
    New,

    /// Timer running
    Sleeping,

    /// Timer fired
    Awake,

    /// Controller could not process the sleeper
    Error,
}

impl Sleeper {
    /// State from status, `New` when no status has been written yet
    pub fn state(&self) -> SleeperState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Requested sleep as a [`Duration`]
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.spec.sleep_for)
    }
}

/// The Sleeper CRD as installed in the cluster, with the readiness
/// annotations other tools use to tell when a Sleeper is done.
pub fn definition() -> CustomResourceDefinition {
    let mut crd = Sleeper::crd();
    let annotations = crd.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(READY_FIELD_PATH_ANNOTATION.to_string(), "status.state".to_string());
    annotations.insert(READY_FIELD_VALUE_ANNOTATION.to_string(), "Awake".to_string());
    crd
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_names() {
        let crd = definition();
        assert_eq!(crd.metadata.name.as_deref(), Some("sleepers.kindstore.microscaler.io"));
        assert_eq!(crd.spec.group, "kindstore.microscaler.io");
        assert_eq!(crd.spec.names.kind, "Sleeper");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions.len(), 1);
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_definition_carries_readiness_annotations() {
        let crd = definition();
        let annotations = crd.metadata.annotations.unwrap();
        assert_eq!(annotations[READY_FIELD_PATH_ANNOTATION], "status.state");
        assert_eq!(annotations[READY_FIELD_VALUE_ANNOTATION], "Awake");
    }

    #[test]
    fn test_state_defaults_to_new() {
        let sleeper = Sleeper::new(
            "nap",
            SleeperSpec {
                sleep_for: 3,
                wakeup_message: "Hello".to_string(),
            },
        );
        assert_eq!(sleeper.state(), SleeperState::New);
        assert_eq!(sleeper.sleep_duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_wire_format() {
        let sleeper: Sleeper = serde_json::from_value(json!({
            "apiVersion": "kindstore.microscaler.io/v1",
            "kind": "Sleeper",
            "metadata": { "name": "nap", "namespace": "default" },
            "spec": { "sleepFor": 2, "wakeupMessage": "Rise" },
            "status": { "state": "Sleeping" }
        }))
        .unwrap();
        assert_eq!(sleeper.spec.sleep_for, 2);
        assert_eq!(sleeper.spec.wakeup_message, "Rise");
        assert_eq!(sleeper.state(), SleeperState::Sleeping);

        let status = SleeperStatus {
            state: SleeperState::Awake,
            message: Some("Rise".to_string()),
            last_transition: None,
        };
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            json!({ "state": "Awake", "message": "Rise" })
        );
    }
}
