//! Line-delimited JSON records emitted by the agent CLI.

use {
    corral_common::Artifact,
    serde::{Deserialize, Serialize},
};

/// One line of agent output. Unknown record types are kept as [`AgentRecord::Other`]
/// so newer agents do not break parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },
    Assistant {
        #[serde(default)]
        message: serde_json::Value,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },
    User {
        #[serde(default)]
        message: serde_json::Value,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },
    /// Failure reported outside a result record, including a non-zero exit
    /// of the agent process.
    Error { message: String },
    #[serde(other)]
    Other,
}

impl AgentRecord {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Error { .. } | Self::Other => None,
        }
    }

    pub fn artifacts(&self) -> &[Artifact] {
        match self {
            Self::System { artifacts, .. }
            | Self::Assistant { artifacts, .. }
            | Self::User { artifacts, .. }
            | Self::Result { artifacts, .. } => artifacts,
            Self::Error { .. } | Self::Other => &[],
        }
    }

    /// Parse one output line. Blank lines and non-JSON noise yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_record() {
        let r = AgentRecord::parse_line(
            r#"{"type":"system","subtype":"init","session_id":"s-1","tools":["Bash"]}"#,
        )
        .unwrap();
        assert_eq!(r.session_id(), Some("s-1"));
        assert!(matches!(r, AgentRecord::System { subtype: Some(ref s), .. } if s == "init"));
    }

    #[test]
    fn parses_result_with_artifacts() {
        let r = AgentRecord::parse_line(
            r#"{"type":"result","subtype":"success","result":"done","session_id":"s-1",
               "artifacts":[{"path":"/workspace/a.txt","filename":"a.txt"}]}"#,
        )
        .unwrap();
        assert_eq!(r.artifacts().len(), 1);
        assert!(matches!(r, AgentRecord::Result { result: Some(ref t), is_error: false, .. } if t == "done"));
    }

    #[test]
    fn unknown_type_is_other() {
        let r = AgentRecord::parse_line(r#"{"type":"stream_event","delta":"x"}"#).unwrap();
        assert_eq!(r, AgentRecord::Other);
    }

    #[test]
    fn noise_is_skipped() {
        assert!(AgentRecord::parse_line("").is_none());
        assert!(AgentRecord::parse_line("npm WARN deprecated").is_none());
        assert!(AgentRecord::parse_line("{ broken").is_none());
    }
}
