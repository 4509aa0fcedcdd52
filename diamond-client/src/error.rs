use std::fmt;
use std::sync::Arc;

use diamond_server_list::{ServerListError, ServerListEvent};
use diamond_snapshot::SnapshotEvent;

/// Returned by every fallible public operation. Carries enough context
/// (url, key, dataId/group) to act on without parsing a message string.
#[derive(Debug, Clone)]
pub enum DiamondError {
    ServerUnavailable { unit: String },
    ServerResponse { url: String, status: Option<u16>, detail: String },
    ServerConflict { url: String },
    BatchDeserialize { body: String },
    InvalidConfig { field: &'static str, reason: String },
}

impl fmt::Display for DiamondError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerUnavailable { unit } => write!(f, "no server available for unit {unit}"),
            Self::ServerResponse { url, status, detail } => {
                write!(f, "request to {url} failed (status={status:?}): {detail}")
            }
            Self::ServerConflict { url } => write!(f, "concurrent modification at {url}"),
            Self::BatchDeserialize { body } => {
                write!(f, "could not parse batch response: {body}")
            }
            Self::InvalidConfig { field, reason } => {
                write!(f, "invalid config field `{field}`: {reason}")
            }
        }
    }
}

impl std::error::Error for DiamondError {}

/// One tagged, reportable event. This is the taxonomy from the spec's error
/// handling design, used for the observable error-event stream -- every
/// variant here is something that is *reported*, not necessarily something
/// that fails a caller's in-flight operation.
#[derive(Debug, Clone)]
pub enum DiamondEvent {
    ServerUnavailable { unit: String },
    ServerResponse { unit: String, url: String, status: Option<u16>, detail: String },
    ServerConflict { unit: String, url: String },
    ServerHostEmpty { unit: String },
    SyncConfig { unit: String, data_id: String, group: String, detail: String },
    LongPulling { unit: String, detail: String },
    BatchDeserialize { unit: String, body: String },
    SnapshotRead { key: String, detail: String },
    SnapshotWrite { key: String, detail: String },
    SnapshotDelete { key: String, detail: String },
    ServerListSnapshotParse { unit: String },
}

impl fmt::Display for DiamondEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerUnavailable { unit } => write!(f, "[{unit}] no server available"),
            Self::ServerResponse { unit, url, status, detail } => {
                write!(f, "[{unit}] {url} failed (status={status:?}): {detail}")
            }
            Self::ServerConflict { unit, url } => write!(f, "[{unit}] conflict at {url}"),
            Self::ServerHostEmpty { unit } => write!(f, "[{unit}] discovery returned no hosts"),
            Self::SyncConfig { unit, data_id, group, detail } => write!(
                f,
                "[{unit}] resync failed for dataId={data_id} group={group}: {detail}"
            ),
            Self::LongPulling { unit, detail } => write!(f, "[{unit}] long poll failed: {detail}"),
            Self::BatchDeserialize { unit, body } => {
                write!(f, "[{unit}] could not parse batch response: {body}")
            }
            Self::SnapshotRead { key, detail } => write!(f, "snapshot read failed for {key}: {detail}"),
            Self::SnapshotWrite { key, detail } => {
                write!(f, "snapshot write failed for {key}: {detail}")
            }
            Self::SnapshotDelete { key, detail } => {
                write!(f, "snapshot delete failed for {key}: {detail}")
            }
            Self::ServerListSnapshotParse { unit } => {
                write!(f, "[{unit}] corrupt server list snapshot, dropped")
            }
        }
    }
}

impl std::error::Error for DiamondEvent {}

impl DiamondEvent {
    pub(crate) fn from_server_list(event: ServerListEvent) -> Self {
        match event {
            ServerListEvent::UpdateServersFailed { unit, error } => match error {
                ServerListError::HostEmpty { .. } => Self::ServerHostEmpty { unit },
                ServerListError::ResponseError { status, detail, .. } => Self::ServerResponse {
                    url: format!("discovery/{unit}"),
                    unit,
                    status,
                    detail,
                },
            },
            ServerListEvent::SnapshotJsonParseError { unit } => Self::ServerListSnapshotParse { unit },
        }
    }

    /// Maps a propagated `DiamondError` to the reportable event with the
    /// same underlying tag, for call sites where a fallback (e.g. the
    /// snapshot in `get_config`) absorbed the failure instead of returning
    /// it -- this keeps the event taxonomy distinguishing what actually
    /// failed rather than collapsing every absorbed error to one tag.
    pub(crate) fn from_error(unit: &str, error: &DiamondError) -> Self {
        match error {
            DiamondError::ServerUnavailable { unit } => Self::ServerUnavailable { unit: unit.clone() },
            DiamondError::ServerResponse { url, status, detail } => Self::ServerResponse {
                unit: unit.to_string(),
                url: url.clone(),
                status: *status,
                detail: detail.clone(),
            },
            DiamondError::ServerConflict { url } => Self::ServerConflict {
                unit: unit.to_string(),
                url: url.clone(),
            },
            DiamondError::BatchDeserialize { body } => Self::BatchDeserialize {
                unit: unit.to_string(),
                body: body.clone(),
            },
            DiamondError::InvalidConfig { .. } => Self::ServerResponse {
                unit: unit.to_string(),
                url: "config".to_string(),
                status: None,
                detail: error.to_string(),
            },
        }
    }

    pub(crate) fn from_snapshot(event: SnapshotEvent) -> Self {
        match event {
            SnapshotEvent::ReadFailed { key, error } => Self::SnapshotRead {
                key,
                detail: error.to_string(),
            },
            SnapshotEvent::WriteFailed { key, error } => Self::SnapshotWrite {
                key,
                detail: error.to_string(),
            },
            SnapshotEvent::DeleteFailed { key, error } => Self::SnapshotDelete {
                key,
                detail: error.to_string(),
            },
        }
    }
}

/// Sink every reportable event is funneled through. The façade owns the one
/// real implementation (a deferred, next-tick dispatcher); sub-components
/// only ever see this narrow callback type.
pub type EventSink = Arc<dyn Fn(DiamondEvent) + Send + Sync>;
