//! Raw, compose-shaped environment document as it appears on disk.
//!
//! These types only capture structure. Every semantic check happens in
//! `services::loader`, which turns a document into a validated [`Model`].
//!
//! [`Model`]: super::spec::Model

use std::collections::BTreeMap;

use serde::Deserialize;

use super::config::EngineConfig;
use super::quantity::ScalarString;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDocument>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<ResourceDocument>>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<ResourceDocument>>,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDocument {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub environment: Option<EnvironmentEntries>,
    #[serde(default)]
    pub ports: Vec<ScalarString>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub depends_on: Option<DependsOnEntries>,
    #[serde(default)]
    pub command: Option<CommandEntry>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckDocument>,
    #[serde(default)]
    pub deploy: Option<DeployDocument>,
}

/// `environment:` as either a mapping or a list of `KEY=VALUE` / `KEY`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentEntries {
    Map(BTreeMap<String, Option<ScalarString>>),
    List(Vec<String>),
}

/// `depends_on:` as a list of names or a mapping with conditions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOnEntries {
    List(Vec<String>),
    Map(BTreeMap<String, DependsOnDocument>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependsOnDocument {
    #[serde(default)]
    pub condition: Option<String>,
}

/// A command written as one line or as an argument list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Line(String),
    Args(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckDocument {
    #[serde(default)]
    pub test: Option<CommandEntry>,
    #[serde(default)]
    pub tcp: Option<u16>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub start_period: Option<String>,
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployDocument {
    #[serde(default)]
    pub resources: Option<ResourcesDocument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcesDocument {
    #[serde(default)]
    pub limits: Option<QuantitiesDocument>,
    #[serde(default)]
    pub reservations: Option<QuantitiesDocument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantitiesDocument {
    #[serde(default)]
    pub cpus: Option<ScalarString>,
    #[serde(default)]
    pub memory: Option<ScalarString>,
}

/// A top-level network or volume declaration. `networks: { backend: }` is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDocument {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: bool,
}
