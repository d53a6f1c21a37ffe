use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_yaml::Value;

use crate::error::{OrchestratorError, Result};
use crate::models::config::EngineConfig;
use crate::models::document::{
    CommandEntry, DependsOnEntries, EnvironmentDocument, EnvironmentEntries, HealthCheckDocument,
    QuantitiesDocument, ResourceDocument, ServiceDocument,
};
use crate::models::quantity::{parse_duration, ScalarString};
use crate::models::spec::DEFAULT_NETWORK;
use crate::models::{
    CpuQuantity, DependencyCondition, HealthCheck, MemoryQuantity, Model, NetworkSpec,
    PortBinding, ProbeKind, Protocol, ResourceRequest, ServiceSpec, VolumeBinding, VolumeSource,
    VolumeSpec,
};
use crate::services::interpolate::{interpolate_value, Variables};

/// File names tried, in order, when no spec path is given.
pub const SPEC_CANDIDATES: [&str; 4] = [
    "envo.yaml",
    "envo.yml",
    "compose.yaml",
    "docker-compose.yml",
];

const FALLBACK_PROJECT: &str = "envo";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

static PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<ip>[0-9.]+|\[[0-9a-fA-F:]+\]):)?(?P<host>\d+):(?P<container>\d+)(?:/(?P<proto>tcp|udp))?$",
    )
    .unwrap()
});

/// Inputs to interpolation and naming that do not come from the document itself.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit project name; wins over the document's `name`.
    pub project: Option<String>,
    /// Entry of `variants:` to apply.
    pub variant: Option<String>,
    /// `--set KEY=VALUE` pairs; highest precedence.
    pub overrides: BTreeMap<String, String>,
    /// Process environment, used for interpolation and value-less environment keys.
    pub env: BTreeMap<String, String>,
}

impl LoadOptions {
    pub fn from_process_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            ..Self::default()
        }
    }
}

/// First spec file candidate present in `dir`.
pub fn discover(dir: &Path) -> Result<PathBuf> {
    SPEC_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| OrchestratorError::SpecNotFound(dir.join(SPEC_CANDIDATES[0])))
}

/// Read and validate a spec file. The project name falls back to the
/// directory holding the file.
pub fn load_file(path: &Path, options: &LoadOptions) -> Result<Model> {
    if !path.is_file() {
        return Err(OrchestratorError::SpecNotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path)?;
    let fallback = path
        .canonicalize()
        .ok()
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| sanitize_project(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_PROJECT.to_string());
    load_with_fallback(&raw, options, &fallback)
}

/// Parse and validate a spec document. Pure: nothing outside `raw` and
/// `options` is consulted.
pub fn load(raw: &str, options: &LoadOptions) -> Result<Model> {
    load_with_fallback(raw, options, FALLBACK_PROJECT)
}

/// Where `.envo/state.json` lives for a spec file.
pub fn state_directory(spec_path: &Path, engine: &EngineConfig) -> PathBuf {
    let base = spec_path.parent().unwrap_or_else(|| Path::new("."));
    base.join(&engine.state_dir)
}

fn sanitize_project(name: &str) -> String {
    let cleaned: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn load_with_fallback(raw: &str, options: &LoadOptions, fallback: &str) -> Result<Model> {
    let mut root: Value =
        serde_yaml::from_str(raw).map_err(|e| OrchestratorError::MalformedSpec(e.to_string()))?;
    let Value::Mapping(map) = &mut root else {
        return Err(OrchestratorError::MalformedSpec(
            "top level must be a mapping".into(),
        ));
    };

    let defaults = map.remove("variables");
    let variants = map.remove("variants");
    let vars = build_variables(defaults, variants, options)?;

    interpolate_value(&mut root, &vars, "")?;

    let document: EnvironmentDocument = serde_yaml::from_value(root)
        .map_err(|e| OrchestratorError::MalformedSpec(e.to_string()))?;

    let project = options
        .project
        .clone()
        .or_else(|| document.name.clone())
        .unwrap_or_else(|| fallback.to_string());

    let model = build_model(document, project, options)?;
    tracing::debug!(
        project = %model.project,
        services = model.services.len(),
        "spec loaded"
    );
    Ok(model)
}

fn scalar_map(value: Option<Value>, what: &str) -> Result<BTreeMap<String, String>> {
    match value {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(v) => serde_yaml::from_value::<BTreeMap<String, ScalarString>>(v)
            .map(|m| m.into_iter().map(|(k, v)| (k, v.0)).collect())
            .map_err(|e| OrchestratorError::MalformedSpec(format!("{what}: {e}"))),
    }
}

fn build_variables(
    defaults: Option<Value>,
    variants: Option<Value>,
    options: &LoadOptions,
) -> Result<Variables> {
    let defaults = scalar_map(defaults, "variables")?;

    let mut presets: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    if let Some(Value::Mapping(entries)) = variants {
        for (name, body) in entries {
            let name = name.as_str().map(str::to_string).ok_or_else(|| {
                OrchestratorError::MalformedSpec("variants: names must be strings".into())
            })?;
            let body = scalar_map(Some(body), &format!("variants.{name}"))?;
            presets.insert(name, body);
        }
    } else if let Some(other) = variants {
        if !other.is_null() {
            return Err(OrchestratorError::MalformedSpec(
                "variants: expected a mapping".into(),
            ));
        }
    }

    let selected = match &options.variant {
        Some(name) => presets.remove(name).ok_or_else(|| {
            let known: Vec<&str> = presets.keys().map(String::as_str).collect();
            OrchestratorError::invalid_field(
                "variants",
                format!("unknown variant '{name}' (known: {})", known.join(", ")),
            )
        })?,
        None => BTreeMap::new(),
    };

    let mut vars = Variables::new();
    vars.push_scope(options.overrides.clone());
    vars.push_scope(selected);
    vars.push_scope(options.env.clone());
    vars.push_scope(defaults);
    Ok(vars)
}

fn check_name(field: &str, name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(OrchestratorError::invalid_field(
            field,
            format!("'{name}' must match [A-Za-z0-9][A-Za-z0-9_.-]*"),
        ))
    }
}

fn build_model(
    document: EnvironmentDocument,
    project: String,
    options: &LoadOptions,
) -> Result<Model> {
    check_name("name", &project)?;
    validate_engine(&document.engine)?;

    let mut networks = BTreeMap::new();
    for (name, decl) in &document.networks {
        check_name(&format!("networks.{name}"), name)?;
        let decl = decl.clone().unwrap_or_default();
        networks.insert(
            name.clone(),
            NetworkSpec {
                name: name.clone(),
                driver: resource_driver(&decl, "bridge"),
                external: decl.external,
            },
        );
    }

    let mut volumes = BTreeMap::new();
    for (name, decl) in &document.volumes {
        check_name(&format!("volumes.{name}"), name)?;
        let decl = decl.clone().unwrap_or_default();
        volumes.insert(
            name.clone(),
            VolumeSpec {
                name: name.clone(),
                driver: resource_driver(&decl, "local"),
                external: decl.external,
            },
        );
    }

    let mut services = BTreeMap::new();
    let mut bound_ports: BTreeMap<(u16, Protocol), String> = BTreeMap::new();
    for (name, raw) in &document.services {
        let service = build_service(name, raw, &document, options)?;
        for (i, port) in service.ports.iter().enumerate() {
            if let Some(owner) = bound_ports.insert((port.host, port.protocol), name.clone()) {
                return Err(OrchestratorError::invalid_field(
                    format!("services.{name}.ports[{i}]"),
                    format!(
                        "host port {}/{} is already bound by service '{owner}'",
                        port.host, port.protocol
                    ),
                ));
            }
        }
        services.insert(name.clone(), service);
    }

    let uses_default = services
        .values()
        .any(|s: &ServiceSpec| s.networks.contains(DEFAULT_NETWORK));
    if uses_default && !networks.contains_key(DEFAULT_NETWORK) {
        networks.insert(
            DEFAULT_NETWORK.to_string(),
            NetworkSpec {
                name: DEFAULT_NETWORK.to_string(),
                driver: "bridge".to_string(),
                external: false,
            },
        );
    }

    Ok(Model {
        project,
        services,
        networks,
        volumes,
        engine: document.engine,
    })
}

fn resource_driver(decl: &ResourceDocument, default: &str) -> String {
    decl.driver
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn validate_engine(engine: &EngineConfig) -> Result<()> {
    if let Some(capacity) = &engine.capacity {
        if let Some(cpus) = &capacity.cpus {
            cpus.parse::<CpuQuantity>()
                .map_err(|e| OrchestratorError::invalid_field("engine.capacity.cpus", e))?;
        }
        if let Some(memory) = &capacity.memory {
            memory
                .parse::<MemoryQuantity>()
                .map_err(|e| OrchestratorError::invalid_field("engine.capacity.memory", e))?;
        }
    }
    if engine.image_pull.attempts == 0 {
        return Err(OrchestratorError::invalid_field(
            "engine.image_pull.attempts",
            "must be at least 1",
        ));
    }
    if engine.reconcile.failure_threshold == 0 {
        return Err(OrchestratorError::invalid_field(
            "engine.reconcile.failure_threshold",
            "must be at least 1",
        ));
    }
    if engine.reconcile.interval.is_zero() {
        return Err(OrchestratorError::invalid_field(
            "engine.reconcile.interval",
            "must be positive",
        ));
    }
    Ok(())
}

fn build_service(
    name: &str,
    raw: &ServiceDocument,
    document: &EnvironmentDocument,
    options: &LoadOptions,
) -> Result<ServiceSpec> {
    let prefix = format!("services.{name}");
    check_name(&prefix, name)?;

    let image = raw
        .image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| {
            OrchestratorError::invalid_field(format!("{prefix}.image"), "image reference is required")
        })?
        .to_string();

    let environment = build_environment(&prefix, raw.environment.as_ref(), &options.env)?;

    let ports = raw
        .ports
        .iter()
        .enumerate()
        .map(|(i, p)| parse_port(&format!("{prefix}.ports[{i}]"), &p.0))
        .collect::<Result<Vec<_>>>()?;

    let volumes = raw
        .volumes
        .iter()
        .enumerate()
        .map(|(i, v)| parse_volume(&format!("{prefix}.volumes[{i}]"), v, document))
        .collect::<Result<Vec<_>>>()?;

    let mut networks = BTreeSet::new();
    for (i, network) in raw.networks.iter().enumerate() {
        if !document.networks.contains_key(network) {
            return Err(OrchestratorError::invalid_field(
                format!("{prefix}.networks[{i}]"),
                format!("network '{network}' is not declared under top-level networks"),
            ));
        }
        networks.insert(network.clone());
    }
    if networks.is_empty() {
        networks.insert(DEFAULT_NETWORK.to_string());
    }

    let depends_on = build_depends_on(&prefix, raw.depends_on.as_ref(), document)?;

    let command = match &raw.command {
        None => None,
        Some(entry) => {
            let argv = command_argv(entry);
            if argv.is_empty() {
                return Err(OrchestratorError::invalid_field(
                    format!("{prefix}.command"),
                    "command must not be empty",
                ));
            }
            Some(argv)
        }
    };

    if let Some(dir) = &raw.working_dir {
        if !dir.starts_with('/') {
            return Err(OrchestratorError::invalid_field(
                format!("{prefix}.working_dir"),
                format!("'{dir}' must be an absolute path"),
            ));
        }
    }

    let resources = build_resources(&prefix, raw)?;
    let healthcheck = build_healthcheck(
        &format!("{prefix}.healthcheck"),
        raw.healthcheck.as_ref(),
        &ports,
        &document.engine,
    )?;

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        environment,
        ports,
        volumes,
        resources,
        networks,
        depends_on,
        command,
        working_dir: raw.working_dir.clone(),
        healthcheck,
    })
}

fn build_environment(
    prefix: &str,
    entries: Option<&EnvironmentEntries>,
    process_env: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let field = format!("{prefix}.environment");
    let mut out = BTreeMap::new();

    let mut put = |key: &str, value: Option<String>| -> Result<()> {
        if key.is_empty() || key.contains('=') {
            return Err(OrchestratorError::invalid_field(
                &field,
                format!("'{key}' is not a valid variable name"),
            ));
        }
        if out.contains_key(key) {
            return Err(OrchestratorError::invalid_field(
                &field,
                format!("duplicate key '{key}'"),
            ));
        }
        // A key without a value inherits from the process environment, if set.
        if let Some(value) = value.or_else(|| process_env.get(key).cloned()) {
            out.insert(key.to_string(), value);
        }
        Ok(())
    };

    match entries {
        None => {}
        Some(EnvironmentEntries::Map(map)) => {
            for (key, value) in map {
                put(key, value.as_ref().map(|v| v.0.clone()))?;
            }
        }
        Some(EnvironmentEntries::List(items)) => {
            for item in items {
                match item.split_once('=') {
                    Some((key, value)) => put(key, Some(value.to_string()))?,
                    None => put(item, None)?,
                }
            }
        }
    }
    Ok(out)
}

fn parse_port(field: &str, raw: &str) -> Result<PortBinding> {
    let caps = PORT_RE.captures(raw.trim()).ok_or_else(|| {
        OrchestratorError::invalid_field(
            field,
            format!("'{raw}' must be [ip:]host:container[/tcp|/udp]"),
        )
    })?;
    let port = |name: &str| -> Result<u16> {
        caps[name]
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                OrchestratorError::invalid_field(
                    field,
                    format!("{name} port '{}' must be in 1..=65535", &caps[name]),
                )
            })
    };
    let host = port("host")?;
    let container = port("container")?;
    let protocol = match caps.name("proto").map(|m| m.as_str()) {
        Some("udp") => Protocol::Udp,
        _ => Protocol::Tcp,
    };
    Ok(PortBinding {
        host_ip: caps.name("ip").map(|m| m.as_str().to_string()),
        host,
        container,
        protocol,
    })
}

fn parse_volume(field: &str, raw: &str, document: &EnvironmentDocument) -> Result<VolumeBinding> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => {
            return Err(OrchestratorError::invalid_field(
                field,
                format!("'{raw}' must be source:target[:ro|:rw]"),
            ))
        }
    };

    let read_only = match mode {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(OrchestratorError::invalid_field(
                field,
                format!("unknown mode '{other}', expected ro or rw"),
            ))
        }
    };

    if source.is_empty() {
        return Err(OrchestratorError::invalid_field(field, "source is empty"));
    }
    if !target.starts_with('/') {
        return Err(OrchestratorError::invalid_field(
            field,
            format!("target '{target}' must be an absolute path"),
        ));
    }

    let is_bind = source.contains('/') || source.starts_with('.') || source.starts_with('~');
    let source = if is_bind {
        VolumeSource::Bind(source.to_string())
    } else {
        if !document.volumes.contains_key(source) {
            return Err(OrchestratorError::invalid_field(
                field,
                format!("volume '{source}' is not declared under top-level volumes"),
            ));
        }
        VolumeSource::Named(source.to_string())
    };

    Ok(VolumeBinding {
        source,
        target: target.to_string(),
        read_only,
    })
}

fn build_depends_on(
    prefix: &str,
    entries: Option<&DependsOnEntries>,
    document: &EnvironmentDocument,
) -> Result<BTreeMap<String, DependencyCondition>> {
    let field = format!("{prefix}.depends_on");
    let pairs: Vec<(String, DependencyCondition)> = match entries {
        None => Vec::new(),
        Some(DependsOnEntries::List(names)) => names
            .iter()
            .map(|n| (n.clone(), DependencyCondition::ServiceStarted))
            .collect(),
        Some(DependsOnEntries::Map(map)) => map
            .iter()
            .map(|(n, dep)| {
                let condition = match dep.condition.as_deref() {
                    None | Some("service_started") => DependencyCondition::ServiceStarted,
                    Some("service_healthy") => DependencyCondition::ServiceHealthy,
                    Some(other) => {
                        return Err(OrchestratorError::invalid_field(
                            format!("{field}.{n}.condition"),
                            format!(
                                "unsupported condition '{other}', expected service_started or service_healthy"
                            ),
                        ))
                    }
                };
                Ok((n.clone(), condition))
            })
            .collect::<Result<_>>()?,
    };

    let mut out = BTreeMap::new();
    for (target, condition) in pairs {
        if !document.services.contains_key(&target) {
            return Err(OrchestratorError::invalid_field(
                &field,
                format!("depends on unknown service '{target}'"),
            ));
        }
        out.insert(target, condition);
    }
    Ok(out)
}

fn command_argv(entry: &CommandEntry) -> Vec<String> {
    match entry {
        CommandEntry::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        CommandEntry::Args(args) => args.clone(),
    }
}

fn parse_cpu(field: &str, value: Option<&ScalarString>) -> Result<Option<CpuQuantity>> {
    value
        .map(|v| {
            v.0.parse::<CpuQuantity>()
                .map_err(|e| OrchestratorError::invalid_field(field, e))
        })
        .transpose()
}

fn parse_memory(field: &str, value: Option<&ScalarString>) -> Result<Option<MemoryQuantity>> {
    value
        .map(|v| {
            v.0.parse::<MemoryQuantity>()
                .map_err(|e| OrchestratorError::invalid_field(field, e))
        })
        .transpose()
}

fn build_resources(prefix: &str, raw: &ServiceDocument) -> Result<ResourceRequest> {
    let Some(resources) = raw.deploy.as_ref().and_then(|d| d.resources.as_ref()) else {
        return Ok(ResourceRequest::default());
    };
    let base = format!("{prefix}.deploy.resources");
    let empty = QuantitiesDocument::default();
    let limits = resources.limits.as_ref().unwrap_or(&empty);
    let reservations = resources.reservations.as_ref().unwrap_or(&empty);

    let request = ResourceRequest {
        cpu_limit: parse_cpu(&format!("{base}.limits.cpus"), limits.cpus.as_ref())?,
        cpu_reservation: parse_cpu(
            &format!("{base}.reservations.cpus"),
            reservations.cpus.as_ref(),
        )?,
        memory_limit: parse_memory(&format!("{base}.limits.memory"), limits.memory.as_ref())?,
        memory_reservation: parse_memory(
            &format!("{base}.reservations.memory"),
            reservations.memory.as_ref(),
        )?,
    };

    if let (Some(reserved), Some(limit)) = (request.cpu_reservation, request.cpu_limit) {
        if reserved > limit {
            return Err(OrchestratorError::invalid_field(
                format!("{base}.reservations.cpus"),
                format!("reservation {reserved} exceeds limit {limit}"),
            ));
        }
    }
    if let (Some(reserved), Some(limit)) = (request.memory_reservation, request.memory_limit) {
        if reserved > limit {
            return Err(OrchestratorError::invalid_field(
                format!("{base}.reservations.memory"),
                format!("reservation {reserved} exceeds limit {limit}"),
            ));
        }
    }
    Ok(request)
}

fn duration_field(field: String, raw: Option<&str>, default: Duration) -> Result<Duration> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let parsed = parse_duration(raw).map_err(|e| OrchestratorError::invalid_field(&field, e))?;
    if parsed.is_zero() {
        return Err(OrchestratorError::invalid_field(field, "must be positive"));
    }
    Ok(parsed)
}

fn build_healthcheck(
    field: &str,
    raw: Option<&HealthCheckDocument>,
    ports: &[PortBinding],
    engine: &EngineConfig,
) -> Result<HealthCheck> {
    let defaults = &engine.health;
    let empty = HealthCheckDocument::default();
    let raw = raw.unwrap_or(&empty);

    let interval = duration_field(
        format!("{field}.interval"),
        raw.interval.as_deref(),
        defaults.interval,
    )?;
    let timeout = duration_field(
        format!("{field}.timeout"),
        raw.timeout.as_deref(),
        defaults.timeout,
    )?;
    let start_period = duration_field(
        format!("{field}.start_period"),
        raw.start_period.as_deref(),
        defaults.start_period,
    )?;

    let probe = if raw.disable {
        ProbeKind::Running
    } else {
        match (&raw.test, raw.tcp) {
            (Some(_), Some(_)) => {
                return Err(OrchestratorError::invalid_field(
                    field,
                    "test and tcp are mutually exclusive",
                ))
            }
            (Some(test), None) => test_probe(&format!("{field}.test"), test)?,
            (None, Some(port)) => tcp_probe(&format!("{field}.tcp"), port, ports)?,
            (None, None) => ProbeKind::Running,
        }
    };

    Ok(HealthCheck {
        probe,
        interval,
        timeout,
        start_period,
    })
}

fn test_probe(field: &str, test: &CommandEntry) -> Result<ProbeKind> {
    let shell = |line: String| ProbeKind::Command {
        argv: vec!["sh".into(), "-c".into(), line],
    };
    match test {
        CommandEntry::Line(line) if line.trim().is_empty() => Err(
            OrchestratorError::invalid_field(field, "health check command is empty"),
        ),
        CommandEntry::Line(line) => Ok(shell(line.clone())),
        CommandEntry::Args(args) => match args.split_first() {
            None => Err(OrchestratorError::invalid_field(
                field,
                "health check command is empty",
            )),
            Some((kind, _)) if kind == "NONE" => Ok(ProbeKind::Running),
            Some((kind, rest)) if kind == "CMD-SHELL" => {
                if rest.is_empty() {
                    return Err(OrchestratorError::invalid_field(
                        field,
                        "CMD-SHELL needs a command",
                    ));
                }
                Ok(shell(rest.join(" ")))
            }
            Some((kind, rest)) if kind == "CMD" => {
                if rest.is_empty() {
                    return Err(OrchestratorError::invalid_field(field, "CMD needs a command"));
                }
                Ok(ProbeKind::Command {
                    argv: rest.to_vec(),
                })
            }
            Some(_) => Ok(ProbeKind::Command {
                argv: args.clone(),
            }),
        },
    }
}

fn tcp_probe(field: &str, container_port: u16, ports: &[PortBinding]) -> Result<ProbeKind> {
    let binding = ports
        .iter()
        .find(|p| p.container == container_port && p.protocol == Protocol::Tcp)
        .ok_or_else(|| {
            OrchestratorError::invalid_field(
                field,
                format!("container port {container_port} has no tcp host binding"),
            )
        })?;
    let host = match binding.host_ip.as_deref() {
        None | Some("0.0.0.0") => "127.0.0.1".to_string(),
        Some(ip) => ip.trim_matches(|c| c == '[' || c == ']').to_string(),
    };
    Ok(ProbeKind::Tcp {
        host,
        port: binding.host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SPARK_DEV: &str = r#"
name: spark-dev
variables:
  workdir: /app
  shell: bash
variants:
  legacy: { workdir: /spark, shell: zsh }
services:
  postgres:
    image: postgres:16
    environment:
      POSTGRES_USER: admin
      POSTGRES_PORT: 5432
    ports: ["5432:5432"]
    volumes: ["pgdata:/var/lib/postgresql/data"]
    networks: [backend]
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U admin"]
      interval: 2s
      start_period: 30s
    deploy:
      resources:
        limits: { cpus: "2", memory: 2g }
        reservations: { cpus: "0.5", memory: 512m }
  spark:
    image: "spark-dev:${shell}"
    working_dir: ${workdir}
    command: sleep infinity
    ports: ["127.0.0.1:2222:22"]
    networks: [backend]
    depends_on:
      postgres: { condition: service_healthy }
    healthcheck:
      tcp: 22
networks:
  backend: { driver: bridge }
volumes:
  pgdata:
"#;

    fn invalid_field(result: Result<Model>) -> (String, String) {
        match result {
            Err(OrchestratorError::InvalidField { field, reason }) => (field, reason),
            Err(other) => panic!("expected InvalidField, got {other}"),
            Ok(_) => panic!("expected InvalidField, got a model"),
        }
    }

    fn with_service(body: &str) -> String {
        format!("services:\n  app:\n{body}")
    }

    #[test]
    fn loads_full_document() {
        let model = load(SPARK_DEV, &LoadOptions::default()).unwrap();
        assert_eq!(model.project, "spark-dev");

        let postgres = model.service("postgres").unwrap();
        assert_eq!(postgres.environment["POSTGRES_PORT"], "5432");
        assert_eq!(postgres.ports[0].host, 5432);
        assert_eq!(
            postgres.volumes[0].source,
            VolumeSource::Named("pgdata".into())
        );
        assert_eq!(postgres.resources.cpu_reservation, Some(CpuQuantity(500)));
        assert_eq!(
            postgres.resources.memory_limit,
            Some(MemoryQuantity(2 << 30))
        );
        assert_eq!(
            postgres.healthcheck.probe,
            ProbeKind::Command {
                argv: vec!["sh".into(), "-c".into(), "pg_isready -U admin".into()]
            }
        );
        assert_eq!(postgres.healthcheck.interval, Duration::from_secs(2));
        assert_eq!(postgres.healthcheck.timeout, Duration::from_secs(5));

        let spark = model.service("spark").unwrap();
        assert_eq!(spark.image, "spark-dev:bash");
        assert_eq!(spark.working_dir.as_deref(), Some("/app"));
        assert_eq!(
            spark.command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        assert_eq!(
            spark.depends_on["postgres"],
            DependencyCondition::ServiceHealthy
        );
        assert_eq!(
            spark.healthcheck.probe,
            ProbeKind::Tcp {
                host: "127.0.0.1".into(),
                port: 2222
            }
        );
        assert_eq!(model.volumes["pgdata"].driver, "local");
        assert!(!model.networks.contains_key(DEFAULT_NETWORK));
    }

    #[test]
    fn variant_and_overrides_take_precedence() {
        let options = LoadOptions {
            variant: Some("legacy".into()),
            ..Default::default()
        };
        let model = load(SPARK_DEV, &options).unwrap();
        let spark = model.service("spark").unwrap();
        assert_eq!(spark.image, "spark-dev:zsh");
        assert_eq!(spark.working_dir.as_deref(), Some("/spark"));

        let options = LoadOptions {
            variant: Some("legacy".into()),
            overrides: [("shell".to_string(), "fish".to_string())].into(),
            env: [("workdir".to_string(), "/ignored".to_string())].into(),
            ..Default::default()
        };
        let model = load(SPARK_DEV, &options).unwrap();
        let spark = model.service("spark").unwrap();
        assert_eq!(spark.image, "spark-dev:fish");
        assert_eq!(spark.working_dir.as_deref(), Some("/spark"));
    }

    #[test]
    fn process_env_beats_variables() {
        let options = LoadOptions {
            env: [("shell".to_string(), "zsh".to_string())].into(),
            ..Default::default()
        };
        let model = load(SPARK_DEV, &options).unwrap();
        assert_eq!(model.service("spark").unwrap().image, "spark-dev:zsh");
    }

    #[test]
    fn unknown_variant_is_invalid_field() {
        let options = LoadOptions {
            variant: Some("nightly".into()),
            ..Default::default()
        };
        let (field, reason) = invalid_field(load(SPARK_DEV, &options));
        assert_eq!(field, "variants");
        assert!(reason.contains("legacy"));
    }

    #[test]
    fn syntax_errors_are_malformed() {
        let err = load("services: [unclosed", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedSpec(_)));

        let err = load("services: {}\nextras: 1\n", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedSpec(_)));

        let err = load("- a\n- b\n", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedSpec(_)));
    }

    #[test]
    fn missing_image_is_invalid_field() {
        let yaml = with_service("    image: \"  \"\n");
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.image");
    }

    #[test]
    fn negative_memory_is_invalid_field() {
        let yaml = with_service(
            "    image: busybox\n    deploy:\n      resources:\n        limits:\n          memory: -256m\n",
        );
        let (field, reason) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.deploy.resources.limits.memory");
        assert!(reason.contains("positive"));
    }

    #[test]
    fn reservation_above_limit_is_rejected() {
        let yaml = with_service(
            "    image: busybox\n    deploy:\n      resources:\n        limits: { cpus: 1 }\n        reservations: { cpus: 2 }\n",
        );
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.deploy.resources.reservations.cpus");
    }

    #[test]
    fn malformed_ports_are_rejected() {
        for port in ["\"80\"", "\"a:b\"", "\"70000:80\"", "\"0:80\""] {
            let yaml = with_service(&format!("    image: busybox\n    ports: [{port}]\n"));
            let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
            assert_eq!(field, "services.app.ports[0]", "port {port}");
        }
    }

    #[test]
    fn duplicate_host_port_is_rejected() {
        let yaml = r#"
services:
  a: { image: busybox, ports: ["8080:80"] }
  b: { image: busybox, ports: ["8080:8080"] }
"#;
        let (field, reason) = invalid_field(load(yaml, &LoadOptions::default()));
        assert_eq!(field, "services.b.ports[0]");
        assert!(reason.contains("'a'"));
    }

    #[test]
    fn udp_and_tcp_on_same_port_coexist() {
        let yaml = r#"
services:
  a: { image: busybox, ports: ["5353:53/udp"] }
  b: { image: busybox, ports: ["5353:53"] }
"#;
        let model = load(yaml, &LoadOptions::default()).unwrap();
        assert_eq!(model.service("a").unwrap().ports[0].protocol, Protocol::Udp);
    }

    #[test]
    fn undeclared_references_are_rejected() {
        let yaml = with_service("    image: busybox\n    volumes: [\"data:/data\"]\n");
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.volumes[0]");

        let yaml = with_service("    image: busybox\n    networks: [frontend]\n");
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.networks[0]");

        let yaml = with_service("    image: busybox\n    depends_on: [db]\n");
        let (field, reason) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.depends_on");
        assert!(reason.contains("db"));
    }

    #[test]
    fn bind_mounts_and_modes() {
        let yaml = with_service(
            "    image: busybox\n    volumes: [\"./conf:/etc/app:ro\", \"/var/run/docker.sock:/var/run/docker.sock\"]\n",
        );
        let model = load(&yaml, &LoadOptions::default()).unwrap();
        let volumes = &model.service("app").unwrap().volumes;
        assert_eq!(volumes[0].source, VolumeSource::Bind("./conf".into()));
        assert!(volumes[0].read_only);
        assert!(!volumes[1].read_only);
    }

    #[test]
    fn services_without_networks_join_default() {
        let yaml = with_service("    image: busybox\n");
        let model = load(&yaml, &LoadOptions::default()).unwrap();
        assert!(model.service("app").unwrap().networks.contains(DEFAULT_NETWORK));
        assert_eq!(model.networks[DEFAULT_NETWORK].driver, "bridge");
        assert_eq!(model.project, "envo");
    }

    #[test]
    fn environment_list_inherits_process_values() {
        let yaml = with_service(
            "    image: busybox\n    environment:\n      - MODE=dev\n      - HOME\n      - UNSET_KEY\n",
        );
        let options = LoadOptions {
            env: [("HOME".to_string(), "/home/dev".to_string())].into(),
            ..Default::default()
        };
        let model = load(&yaml, &options).unwrap();
        let env = &model.service("app").unwrap().environment;
        assert_eq!(env["MODE"], "dev");
        assert_eq!(env["HOME"], "/home/dev");
        assert!(!env.contains_key("UNSET_KEY"));
    }

    #[test]
    fn duplicate_environment_key_is_rejected() {
        let yaml = with_service("    image: busybox\n    environment: [\"A=1\", \"A=2\"]\n");
        let (field, reason) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.environment");
        assert!(reason.contains("duplicate"));
    }

    #[test]
    fn tcp_probe_requires_host_binding() {
        let yaml = with_service("    image: busybox\n    healthcheck:\n      tcp: 80\n");
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.healthcheck.tcp");
    }

    #[test]
    fn healthcheck_none_means_running_probe() {
        let yaml = with_service(
            "    image: busybox\n    healthcheck:\n      test: [\"NONE\"]\n      timeout: 1s\n",
        );
        let model = load(&yaml, &LoadOptions::default()).unwrap();
        let hc = &model.service("app").unwrap().healthcheck;
        assert_eq!(hc.probe, ProbeKind::Running);
        assert_eq!(hc.timeout, Duration::from_secs(1));
    }

    #[test]
    fn bad_duration_is_invalid_field() {
        let yaml = with_service("    image: busybox\n    healthcheck:\n      interval: often\n");
        let (field, _) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.healthcheck.interval");
    }

    #[test]
    fn unset_variable_is_invalid_field() {
        let yaml = with_service("    image: \"busybox:${tag}\"\n");
        let (field, reason) = invalid_field(load(&yaml, &LoadOptions::default()));
        assert_eq!(field, "services.app.image");
        assert!(reason.contains("tag"));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let yaml = "services:\n  \"-bad\": { image: busybox }\n";
        let (field, _) = invalid_field(load(yaml, &LoadOptions::default()));
        assert_eq!(field, "services.-bad");
    }

    #[test]
    fn image_grammar_is_not_checked_at_load() {
        let yaml = with_service("    image: \"Not A Ref\"\n");
        assert!(load(&yaml, &LoadOptions::default()).is_ok());
    }

    #[test]
    fn load_file_defaults_project_to_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("My Project");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("envo.yaml"), "services:\n  a: { image: busybox }\n").unwrap();

        let path = discover(&dir).unwrap();
        let model = load_file(&path, &LoadOptions::default()).unwrap();
        assert_eq!(model.project, "my-project");
        assert_eq!(state_directory(&path, &model.engine), dir.join(".envo"));
    }

    #[test]
    fn missing_file_is_spec_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(dir.path()),
            Err(OrchestratorError::SpecNotFound(_))
        ));
        assert!(matches!(
            load_file(&dir.path().join("envo.yaml"), &LoadOptions::default()),
            Err(OrchestratorError::SpecNotFound(_))
        ));
    }

    #[test]
    fn discover_prefers_envo_over_compose() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        fs::write(dir.path().join("envo.yml"), "services: {}\n").unwrap();
        assert_eq!(discover(dir.path()).unwrap(), dir.path().join("envo.yml"));
    }
}
