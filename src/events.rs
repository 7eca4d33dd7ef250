//! Kubernetes event emission.
//!
//! Reason codes are a user-facing contract: dashboards and runbooks grep for
//! them. New reasons are additive only.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::{info, warn};

pub const REPORTER: &str = "karpenter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Nominated,
    Evicted,
    FailedDraining,
    Disrupted,
    TerminationGracePeriodExpiring,
    FailedScheduling,
    NoCompatibleInstanceTypes,
    InsufficientCapacityError,
    Unconsolidatable,
    PreferredAntiAffinityInhibitsConsolidation,
    RegistrationFailed,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominated => "Nominated",
            Self::Evicted => "Evicted",
            Self::FailedDraining => "FailedDraining",
            Self::Disrupted => "Disrupted",
            Self::TerminationGracePeriodExpiring => "TerminationGracePeriodExpiring",
            Self::FailedScheduling => "FailedScheduling",
            Self::NoCompatibleInstanceTypes => "NoCompatibleInstanceTypes",
            Self::InsufficientCapacityError => "InsufficientCapacityError",
            Self::Unconsolidatable => "Unconsolidatable",
            Self::PreferredAntiAffinityInhibitsConsolidation => {
                "PreferredAntiAffinityInhibitsConsolidation"
            }
            Self::RegistrationFailed => "RegistrationFailed",
        }
    }

    fn event_type(&self) -> EventType {
        match self {
            Self::Nominated | Self::Evicted | Self::Disrupted => EventType::Normal,
            _ => EventType::Warning,
        }
    }
}

/// Publishes events against arbitrary objects. Constructed without a client
/// in tests, where events land in the log only.
#[derive(Clone)]
pub struct EventRecorder {
    recorder: Option<Recorder>,
}

impl EventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER.into(),
            instance: None,
        };
        Self {
            recorder: Some(Recorder::new(client, reporter)),
        }
    }

    pub fn disconnected() -> Self {
        Self { recorder: None }
    }

    pub async fn publish(&self, reference: &ObjectReference, reason: Reason, note: String) {
        info!(
            kind = reference.kind.as_deref().unwrap_or_default(),
            name = reference.name.as_deref().unwrap_or_default(),
            reason = reason.as_str(),
            note = %note,
            "event"
        );
        let Some(recorder) = &self.recorder else {
            return;
        };
        let event = Event {
            type_: reason.event_type(),
            reason: reason.as_str().to_string(),
            note: Some(note),
            action: reason.as_str().to_string(),
            secondary: None,
        };
        if let Err(error) = recorder.publish(&event, reference).await {
            warn!(%error, reason = reason.as_str(), "failed to publish event");
        }
    }
}

/// Reference helper for objects that carry name/namespace/uid metadata.
pub fn object_ref(
    kind: &str,
    api_version: &str,
    name: &str,
    namespace: Option<&str>,
    uid: Option<&str>,
) -> ObjectReference {
    ObjectReference {
        kind: Some(kind.to_string()),
        api_version: Some(api_version.to_string()),
        name: Some(name.to_string()),
        namespace: namespace.map(String::from),
        uid: uid.map(String::from),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(Reason::FailedScheduling.as_str(), "FailedScheduling");
        assert_eq!(
            Reason::NoCompatibleInstanceTypes.as_str(),
            "NoCompatibleInstanceTypes"
        );
        assert_eq!(
            Reason::PreferredAntiAffinityInhibitsConsolidation.as_str(),
            "PreferredAntiAffinityInhibitsConsolidation"
        );
    }

    #[tokio::test]
    async fn disconnected_recorder_does_not_panic() {
        let recorder = EventRecorder::disconnected();
        let reference = object_ref("Pod", "v1", "a", Some("default"), None);
        recorder
            .publish(&reference, Reason::Evicted, "gone".into())
            .await;
    }
}
