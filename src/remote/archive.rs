//! Wire archives for cross-node task movement.
//!
//! Submissions and completions are batched per destination node into
//! MessagePack archives. An archive carries everything the peer needs to
//! reconstruct or finish a task; run-state flags never travel.

use serde::{Deserialize, Serialize};

use crate::domain::DomainQuery;
use crate::task::{FlagSet, MethodId, NodeId, PoolId, TaskNode, TaskPrio};

/// One task shipped to a peer for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitEntry {
    pub pool: PoolId,
    pub method: MethodId,
    pub node: TaskNode,
    pub prio: TaskPrio,
    pub flags: FlagSet,
    /// Already resolved to a container local to the destination.
    pub query: DomainQuery,
    /// Completion token in the origin's pending table.
    pub token: u64,
    /// Module-serialized input payload.
    pub payload: Vec<u8>,
}

/// A batch of submissions from one origin node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitArchive {
    pub origin: NodeId,
    pub entries: Vec<SubmitEntry>,
}

/// One finished task's outputs, shipped back to its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEntry {
    pub token: u64,
    /// Module-serialized output payload.
    pub payload: Vec<u8>,
}

/// A batch of completions from one executing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteArchive {
    pub origin: NodeId,
    pub entries: Vec<CompleteEntry>,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(value)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SubDomain;
    use crate::task::TaskId;

    #[test]
    fn test_submit_archive_round_trip() {
        let archive = SubmitArchive {
            origin: 1,
            entries: vec![SubmitEntry {
                pool: PoolId::new(1, 5),
                method: 10,
                node: TaskNode::root(TaskId::new(1, 77)),
                prio: TaskPrio::HighLatency,
                flags: FlagSet {
                    data_owner: true,
                    ..FlagSet::default()
                },
                query: DomainQuery::direct_id(SubDomain::ContainerSet, 3),
                token: 42,
                payload: vec![1, 2, 3],
            }],
        };

        let bytes = encode(&archive).unwrap();
        let decoded: SubmitArchive = decode(&bytes).unwrap();
        assert_eq!(decoded.origin, 1);
        assert_eq!(decoded.entries.len(), 1);
        let entry = &decoded.entries[0];
        assert_eq!(entry.token, 42);
        assert_eq!(entry.node.root, TaskId::new(1, 77));
        assert!(entry.flags.data_owner);
        assert_eq!(entry.query.container_id(), Some(3));
        assert_eq!(entry.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_archive_fails_cleanly() {
        let archive = CompleteArchive {
            origin: 2,
            entries: vec![CompleteEntry {
                token: 7,
                payload: vec![9; 16],
            }],
        };
        let bytes = encode(&archive).unwrap();
        assert!(decode::<CompleteArchive>(&bytes[..bytes.len() / 2]).is_err());
    }
}
