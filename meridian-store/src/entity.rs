use chrono::{DateTime, Utc};
use meridian_core::entities::{fleet::Fleet, instance::Instance, job::Job, run::Run};
use meridian_core::ids::{FleetId, InstanceId, JobId, RunId};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// What the generic [`crate::SqlStore`]/[`crate::MemoryStore`] need to know
/// about a reconciled entity kind to store it in the shared `entities` table
/// (spec §6's "persistent store façade").
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Id: Copy + Eq + std::hash::Hash + Display + FromStr + Send + Sync;

    /// Discriminator for the shared table's `kind` column.
    const KIND: &'static str;

    fn id(&self) -> Self::Id;
    fn parent_id(&self) -> Option<String>;
    fn last_processed_at(&self) -> Option<DateTime<Utc>>;
    fn set_last_processed_at(&mut self, at: DateTime<Utc>);
    fn version(&self) -> i64;
    fn set_version(&mut self, v: i64);
    fn is_deleted(&self) -> bool;
}

impl Entity for Instance {
    type Id = InstanceId;
    const KIND: &'static str = "instance";

    fn id(&self) -> Self::Id {
        self.id
    }

    /// The Fleet reconciler needs "live instances of this fleet"; the Pool
    /// grouping has no reconciler that queries by it, so `fleet_id` is the
    /// more useful parent key here (unfleeted instances have no parent row).
    fn parent_id(&self) -> Option<String> {
        self.fleet_id.map(|id| id.to_string())
    }

    fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
    }

    fn set_last_processed_at(&mut self, at: DateTime<Utc>) {
        self.last_processed_at = Some(at);
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Entity for Job {
    type Id = JobId;
    const KIND: &'static str = "job";

    fn id(&self) -> Self::Id {
        self.id
    }

    fn parent_id(&self) -> Option<String> {
        Some(self.run_id.to_string())
    }

    fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
    }

    fn set_last_processed_at(&mut self, at: DateTime<Utc>) {
        self.last_processed_at = Some(at);
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn is_deleted(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Entity for Run {
    type Id = RunId;
    const KIND: &'static str = "run";

    fn id(&self) -> Self::Id {
        self.id
    }

    fn parent_id(&self) -> Option<String> {
        self.fleet_id.map(|id| id.to_string())
    }

    fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
    }

    fn set_last_processed_at(&mut self, at: DateTime<Utc>) {
        self.last_processed_at = Some(at);
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn is_deleted(&self) -> bool {
        self.processing_finished && self.status.is_terminal()
    }
}

impl Entity for Fleet {
    type Id = FleetId;
    const KIND: &'static str = "fleet";

    fn id(&self) -> Self::Id {
        self.id
    }

    fn parent_id(&self) -> Option<String> {
        Some(self.project_id.to_string())
    }

    fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
    }

    fn set_last_processed_at(&mut self, at: DateTime<Utc>) {
        self.last_processed_at = Some(at);
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, v: i64) {
        self.version = v;
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}
