//! Commands replicated through Raft consensus.
//!
//! Every mutation of the user log goes through this enum: it is carried
//! in the consensus log and applied deterministically, in the same
//! order, on every node. The enum tag is the command kind; an append's
//! payload stays in the record's canonical binary encoding so the state
//! machine applies exactly the bytes the producer sent.

use serde::{Deserialize, Serialize};

/// Commands that are replicated through Raft consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogCommand {
    /// Append one record to the user log. The payload is the
    /// prost-encoded record.
    Append { record: Vec<u8> },

    /// Add a member to the cluster. Membership changes go through the
    /// consensus library's configuration-change protocol; this command is
    /// kept on the wire for compatibility and applies as a no-op.
    JoinCluster {
        server_id: String,
        rpc_addr: String,
        voter: bool,
    },
}

/// Response from applying a command to the state machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Offset assigned by the user log, present for applied appends.
    pub offset: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trips_through_json() {
        let cmd = LogCommand::Append {
            record: vec![0x0a, 0x03, b'a', b'b', b'c'],
        };
        let encoded = serde_json::to_vec(&cmd).expect("serialize");
        let decoded: LogCommand = serde_json::from_slice(&encoded).expect("deserialize");
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn test_join_command_round_trips() {
        let cmd = LogCommand::JoinCluster {
            server_id: "node-1".to_string(),
            rpc_addr: "127.0.0.1:8401".to_string(),
            voter: true,
        };
        let encoded = serde_json::to_vec(&cmd).expect("serialize");
        let decoded: LogCommand = serde_json::from_slice(&encoded).expect("deserialize");
        assert_eq!(cmd, decoded);
    }
}
