//! Identifier newtypes shared across the kernel.
//!
//! All ids are 32-byte values. Agent ids are derived from key material;
//! task, need, proposal, and thread ids are content hashes chosen by their
//! creators; `ContentHash` is the output of the kernel hash function.

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id32 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize, Encode, Decode, Default,
        )]
        pub struct $name(pub [u8; 32]);

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(b: [u8; 32]) -> Self {
                Self(b)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let short = self.0.get(..8).unwrap_or(&self.0);
                write!(f, concat!(stringify!($name), "(0x{})"), hex::encode(short))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }
    };
}

id32!(
    /// Stable identity of an agent node, derived from its public key hash.
    AgentId
);
id32!(
    /// Output of the kernel hash function over canonical bytes.
    ContentHash
);
id32!(
    /// A unit of plannable work in the derived graph.
    TaskId
);
id32!(
    /// A uniquely identified request for work; the unit of plan exclusivity.
    NeedId
);
id32!(
    /// A proposed plan for a need. Doubles as the root task id of the
    /// proposed subtree, so branch membership falls out of `LINK` facts.
    ProposalId
);
id32!(
    /// Conversation/workflow grouping for envelopes and reconciliation.
    ThreadId
);

impl ProposalId {
    /// The root task of the subtree this proposal introduced.
    pub fn root_task(&self) -> TaskId {
        TaskId(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_truncated_hex() {
        let id = TaskId([0xAB; 32]);
        assert_eq!(format!("{:?}", id), "TaskId(0xabababababababab)");
    }

    #[test]
    fn ordering_is_lexicographic_on_bytes() {
        let a = AgentId([1; 32]);
        let b = AgentId([2; 32]);
        assert!(a < b);
    }
}
