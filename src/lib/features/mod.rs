//! Lifecycle hooks attached to a task run.
//!
//! Every feature implements a subset of `link`, `created`, `stopped` and
//! `killed`; the rest fall back to no-ops. Hooks run in that order at fixed
//! points of `TaskExecution::run`.

pub mod artifacts;
pub mod bulk_log;
pub mod services;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::lib::error::FeatureError;
use crate::lib::tasks::execution::TaskExecution;
use crate::lib::tasks::types::{Bind, Link};

/// What features contribute to the task container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub env: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    pub links: Vec<Link>,
}

impl LinkInfo {
    pub fn merge(&mut self, other: LinkInfo) {
        self.env.extend(other.env);
        self.binds.extend(other.binds);
        self.links.extend(other.links);
    }
}

#[async_trait]
pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;

    /// Before the container exists: contribute env, binds and links.
    async fn link(&self, _task: &TaskExecution) -> Result<LinkInfo, FeatureError> {
        Ok(LinkInfo::default())
    }

    async fn created(&self, _task: &TaskExecution) -> Result<(), FeatureError> {
        Ok(())
    }

    /// After the container exited. A failure fails the run.
    async fn stopped(&self, _task: &TaskExecution) -> Result<(), FeatureError> {
        Ok(())
    }

    /// Final cleanup. Failures are only logged.
    async fn killed(&self, _task: &TaskExecution) -> Result<(), FeatureError> {
        Ok(())
    }
}

pub struct FeatureEntry {
    pub name: &'static str,
    pub enabled_by_default: bool,
    build: fn() -> Box<dyn Feature>,
}

/// Payload flag name -> feature constructor.
pub struct FeatureRegistry {
    entries: Vec<FeatureEntry>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl FeatureRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn standard() -> Self {
        Self::empty()
            .with("artifacts", true, || Box::new(artifacts::Artifacts))
            .with("bulkLog", true, || Box::new(bulk_log::BulkLog))
            .with("services", true, || Box::new(services::Services::default()))
    }

    pub fn with(
        mut self,
        name: &'static str,
        enabled_by_default: bool,
        build: fn() -> Box<dyn Feature>,
    ) -> Self {
        self.entries.push(FeatureEntry {
            name,
            enabled_by_default,
            build,
        });
        self
    }

    /// Fresh instances of every feature enabled for this payload. Explicit
    /// `payload.features` flags override the defaults.
    pub fn select(&self, payload: &serde_json::Value) -> Vec<Box<dyn Feature>> {
        let flags = payload.get("features").and_then(|f| f.as_object());
        self.entries
            .iter()
            .filter(|entry| {
                flags
                    .and_then(|f| f.get(entry.name))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(entry.enabled_by_default)
            })
            .map(|entry| (entry.build)())
            .collect()
    }
}
