//! Typed ID definitions.
//!
//! Generated ids carry a prefix naming what they identify; cloud ids are
//! opaque strings owned by the infrastructure API.

use crate::{define_cid, define_id};

// =============================================================================
// Generated by the director
// =============================================================================

// Handed to the cloud at VM creation; the agent on the new VM answers to it.
define_id!(AgentId, "agent");
define_id!(TaskId, "task");
define_id!(LockOwnerId, "owner");

// =============================================================================
// Assigned by the cloud
// =============================================================================

define_cid!(VmCid);
define_cid!(DiskCid);
define_cid!(StemcellCid);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_agent_id_roundtrip() {
        let id = AgentId::new();
        let s = id.to_string();
        let parsed: AgentId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_agent_id_prefix() {
        let id = AgentId::new();
        assert!(id.to_string().starts_with("agent_"));
    }

    #[test]
    fn test_agent_id_invalid_prefix() {
        let result: Result<AgentId, _> = "task_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_agent_id_missing_separator() {
        let result: Result<AgentId, _> = "agent01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_agent_id_invalid_ulid() {
        let result: Result<AgentId, _> = "agent_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_agent_ids_are_unique() {
        assert_ne!(AgentId::new(), AgentId::new());
    }

    #[test]
    fn test_cid_rejects_empty() {
        let result: Result<VmCid, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_cid_serializes_as_bare_string() {
        let cid = DiskCid::new("disk-1");
        assert_eq!(serde_json::to_string(&cid).unwrap(), "\"disk-1\"");
        let parsed: DiskCid = serde_json::from_str("\"disk-1\"").unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [AgentId::PREFIX, TaskId::PREFIX, LockOwnerId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn cid_display_roundtrip(raw in "[a-zA-Z0-9-]{1,40}") {
            let cid: VmCid = raw.parse().unwrap();
            prop_assert_eq!(cid.to_string(), raw);
        }
    }
}
