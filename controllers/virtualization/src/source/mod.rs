//! Data sources
//!
//! One strategy per `DataSource.Type`. A strategy validates the source
//! without side effects, drives provisioning of the object, and cleans up
//! whatever it created. Strategies are generic over the kind they fill.

pub mod dvcr_import;
pub mod errors;
pub mod http;
pub mod object_ref;
pub mod pvc;
pub mod registry;
pub mod upload;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crds::DataSourceType;
use crds::conditions::image::{ConditionType, ReadyReason};
use crds::conditions::{ConditionBuilder, ConditionStatus, find_condition, set_condition};

use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;

/// Provisioning strategy for one data source type.
#[async_trait]
pub trait Source<K: Provisionable>: Send + Sync {
    /// Advances provisioning, updating the status of `obj`.
    async fn sync(&self, obj: &mut K) -> Result<ReconcileResult, ControllerError>;

    /// Removes supplements; returns true while something is left to remove.
    async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError>;

    /// Checks that the source can be used.
    async fn validate(&self, obj: &K) -> Result<(), ControllerError>;
}

/// Strategies keyed by data source type.
pub struct Sources<K> {
    sources: HashMap<DataSourceType, Box<dyn Source<K>>>,
}

impl<K> std::fmt::Debug for Sources<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.sources.keys()).finish()
    }
}

impl<K: Provisionable> Default for Sources<K> {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }
}

impl<K: Provisionable> Sources<K> {
    /// Registers a strategy.
    #[must_use]
    pub fn with(mut self, type_: DataSourceType, source: impl Source<K> + 'static) -> Self {
        self.sources.insert(type_, Box::new(source));
        self
    }

    /// Strategy of a data source type.
    pub fn get(&self, type_: DataSourceType) -> Option<&dyn Source<K>> {
        self.sources.get(&type_).map(AsRef::as_ref)
    }

    /// Runs every strategy's clean-up; true when any of them needs another pass.
    pub async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError> {
        let mut requeue = false;
        for source in self.sources.values() {
            requeue |= source.clean_up(obj).await?;
        }
        Ok(requeue)
    }
}

/// Strategies for every data source type.
pub fn all_sources<K: Provisionable>(ctx: &Arc<Context>) -> Sources<K> {
    Sources::default()
        .with(DataSourceType::Http, http::HttpSource::new(Arc::clone(ctx)))
        .with(DataSourceType::ContainerImage, registry::RegistrySource::new(Arc::clone(ctx)))
        .with(DataSourceType::ObjectRef, object_ref::ObjectRefSource::new(Arc::clone(ctx)))
        .with(DataSourceType::Upload, upload::UploadSource::new(Arc::clone(ctx)))
}

/// Sets the `Ready` condition for the object's current generation.
pub fn set_ready<K: Provisionable>(obj: &mut K, status: ConditionStatus, reason: ReadyReason, message: &str) {
    let condition = ConditionBuilder::new(ConditionType::Ready)
        .generation(meta::generation(obj))
        .status(status)
        .reason(reason)
        .message(message)
        .build();
    set_condition(obj.conditions_mut(), condition);
}

/// Returns true once provisioning has finished.
pub fn is_ready<K: Provisionable>(obj: &K) -> bool {
    find_condition(obj.conditions(), ConditionType::Ready.as_str())
        .is_some_and(|c| c.is_true() && c.reason == ReadyReason::Ready.as_str())
}

/// Requeue delay while a quota blocks supplements: short for new objects,
/// longer once the object has waited a while.
pub fn quota_requeue<K: Provisionable>(obj: &K) -> ReconcileResult {
    let age = meta::age(obj, Utc::now());
    let delay = if age < chrono::Duration::minutes(1) {
        Duration::from_secs(5)
    } else if age < chrono::Duration::minutes(10) {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(120)
    };
    ReconcileResult::requeue_after(delay)
}

/// Message of a terminal provisioning failure, e.g. `Provisioning failed: ... .`
pub fn failure_message(error: &impl std::fmt::Display) -> String {
    format!("{}.", crds::conditions::capitalize_first_letter(&error.to_string()))
}
