//! Strongly-typed entity identifiers.
//!
//! Every entity is referenced by id only (never by an in-memory owning
//! pointer) so that cyclic relationships (Run <-> Job, Fleet <-> Instance)
//! are expressed as plain foreign keys, with the store as the graph.

use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(ProjectId);
id_type!(BackendId);
id_type!(PoolId);
id_type!(FleetId);
id_type!(InstanceId);
id_type!(RunId);
id_type!(JobId);
id_type!(VolumeId);
id_type!(PlacementGroupId);
id_type!(GatewayId);
id_type!(RepoCredsId);
