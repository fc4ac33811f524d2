use serde::{Deserialize, Serialize};
use serde_json::Value;

const ACCEPTED_MESSAGE_TYPE: &str = "accepted";

/// Acceptance ack pushed over the status WebSocket, exactly once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedMessage {
    pub jobid: u64,
    #[serde(rename = "type")]
    pub message_type: String,
}

impl AcceptedMessage {
    pub fn new(jobid: u64) -> Self {
        Self {
            jobid,
            message_type: ACCEPTED_MESSAGE_TYPE.to_owned(),
        }
    }
}

/// Body of `POST jobs/<id>/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: StatusFrame,
}

impl StatusBody {
    pub fn new(status: StatusFrame) -> Self {
        Self { status }
    }
}

/// The status map progresses through three shapes during a job's life:
/// the running frame, the upload-marker frame on entering `stopping`, and
/// the terminal frame. One struct with optional fields keeps the wire
/// serialization in a single place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_srv_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_execution_paused: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_order: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_terminal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl StatusFrame {
    /// Frame sent while the engine runs. With a livelog viewer attached the
    /// frame additionally carries the (here always empty) log deltas.
    pub fn running(
        cmd_srv_url: Option<String>,
        worker_hostname: String,
        worker_id: u64,
        livelog: bool,
    ) -> Self {
        let mut frame = Self {
            cmd_srv_url,
            test_execution_paused: Some(0),
            worker_hostname: Some(worker_hostname),
            worker_id: Some(worker_id),
            ..Self::default()
        };
        if livelog {
            frame.log = Some(Value::Object(Default::default()));
            frame.serial_log = Some(Value::Object(Default::default()));
            frame.serial_terminal = Some(Value::Object(Default::default()));
        }
        frame
    }

    /// Marker frame announcing the final upload phase.
    pub fn uploading_marker(worker_id: u64) -> Self {
        Self {
            uploading: Some(1),
            worker_id: Some(worker_id),
            ..Self::default()
        }
    }

    /// Final snapshot posted right before `set_done`.
    pub fn terminal(
        backend: String,
        cmd_srv_url: Option<String>,
        test_order: Vec<Value>,
        worker_hostname: String,
        worker_id: u64,
        setup_error: Option<String>,
        exit_status: Option<i32>,
    ) -> Self {
        Self {
            backend: Some(backend),
            cmd_srv_url,
            result: Some(Value::Object(Default::default())),
            test_execution_paused: Some(0),
            test_order: Some(test_order),
            worker_hostname: Some(worker_hostname),
            worker_id: Some(worker_id),
            setup_error,
            exit_status,
            ..Self::default()
        }
    }
}

/// Counters posted to the liveview handler while a livelog viewer is
/// attached. All four fields are always serialized; absent positions are
/// `null` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub outstanding_files: u32,
    pub outstanding_images: u32,
    pub upload_up_to: Option<String>,
    pub upload_up_to_current_module: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{StatusFrame, UploadProgress};

    #[test]
    fn running_frame_omits_terminal_fields() {
        let frame = StatusFrame::running(
            Some("http://127.0.0.1:20013".to_owned()),
            "grid-7".to_owned(),
            42,
            false,
        );
        let serialized = serde_json::to_value(&frame).expect("serialize running frame");

        assert_eq!(
            serialized,
            json!({
                "cmd_srv_url": "http://127.0.0.1:20013",
                "test_execution_paused": 0,
                "worker_hostname": "grid-7",
                "worker_id": 42,
            })
        );
    }

    #[test]
    fn livelog_enrichment_adds_empty_log_maps() {
        let frame = StatusFrame::running(None, "grid-7".to_owned(), 42, true);
        let serialized = serde_json::to_value(&frame).expect("serialize enriched frame");

        assert_eq!(serialized["log"], json!({}));
        assert_eq!(serialized["serial_log"], json!({}));
        assert_eq!(serialized["serial_terminal"], json!({}));
    }

    #[test]
    fn uploading_marker_is_minimal() {
        let serialized = serde_json::to_value(StatusFrame::uploading_marker(42))
            .expect("serialize upload marker");

        assert_eq!(serialized, json!({"uploading": 1, "worker_id": 42}));
    }

    #[test]
    fn terminal_frame_carries_empty_result_and_the_test_order() {
        let frame = StatusFrame::terminal(
            "qemu".to_owned(),
            None,
            vec![json!({"name": "boot"})],
            "grid-7".to_owned(),
            42,
            None,
            None,
        );
        let serialized = serde_json::to_value(&frame).expect("serialize terminal frame");

        assert_eq!(serialized["result"], json!({}));
        assert_eq!(serialized["test_order"], json!([{"name": "boot"}]));
        assert_eq!(serialized["test_execution_paused"], json!(0));
        assert!(serialized.get("uploading").is_none());
    }

    #[test]
    fn upload_progress_serializes_absent_positions_as_null() {
        let serialized =
            serde_json::to_value(UploadProgress::default()).expect("serialize upload progress");

        assert_eq!(
            serialized,
            json!({
                "outstanding_files": 0,
                "outstanding_images": 0,
                "upload_up_to": null,
                "upload_up_to_current_module": null,
            })
        );
    }
}
