//! Declarative service graph.
//!
//! A `ClusterGraph` is built once per run from static declarations and
//! validated up front: duplicate names, unknown dependencies and cycles are
//! rejected here so the orchestrator never waits on a service that can not
//! become ready. The topological order computed during validation is the
//! order the orchestrator walks every tick.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_replicas() -> u32 { 1 }

/// One service to orchestrate. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    /// Desired replica count; 0 runs one task on every node (global mode).
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Placement constraints, e.g. `node.role == manager`.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            replicas: 1,
            dependencies: Vec::new(),
            networks: Vec::new(),
            mounts: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn replicas(mut self, replicas: u32) -> Self { self.replicas = replicas; self }

    pub fn global(self) -> Self { self.replicas(0) }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn network(mut self, net: impl Into<String>) -> Self { self.networks.push(net.into()); self }

    pub fn is_global(&self) -> bool { self.replicas == 0 }
}

/// A service found on the substrate that the graph does not declare.
/// Reported in status output but never started, stopped or waited on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub id: String,
    pub name: String,
    pub image: String,
    /// `None` for global services.
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEntry {
    Declared(ServiceSpec),
    Discovered(DiscoveredService),
}

impl GraphEntry {
    pub fn name(&self) -> &str {
        match self {
            GraphEntry::Declared(s) => &s.name,
            GraphEntry::Discovered(d) => &d.name,
        }
    }

    pub fn is_declared(&self) -> bool { matches!(self, GraphEntry::Declared(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate service name: {0}")]
    DuplicateService(String),
    #[error("service {service} depends on unknown service {dependency}")]
    DependencyNotFound { service: String, dependency: String },
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("invalid graph file: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct GraphFile {
    name: String,
    #[serde(default)]
    networks: Vec<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone)]
pub struct ClusterGraph {
    name: String,
    services: BTreeMap<String, ServiceSpec>,
    order: Vec<String>,
    networks: Vec<String>,
    volumes: Vec<String>,
    discovered: BTreeMap<String, DiscoveredService>,
}

impl ClusterGraph {
    /// Validate `specs` and build the graph. Services keep their declaration
    /// order wherever the dependency order leaves a choice.
    pub fn new(
        name: impl Into<String>,
        specs: Vec<ServiceSpec>,
        networks: Vec<String>,
        volumes: Vec<String>,
    ) -> Result<Self, GraphError> {
        let mut declared: Vec<String> = Vec::with_capacity(specs.len());
        let mut services = BTreeMap::new();
        for spec in specs {
            if services.contains_key(&spec.name) {
                return Err(GraphError::DuplicateService(spec.name));
            }
            declared.push(spec.name.clone());
            services.insert(spec.name.clone(), spec);
        }
        for name in &declared {
            let spec = &services[name];
            for dep in &spec.dependencies {
                if !services.contains_key(dep) {
                    return Err(GraphError::DependencyNotFound { service: name.clone(), dependency: dep.clone() });
                }
            }
        }
        let order = topo_order(&declared, &services)?;
        Ok(Self { name: name.into(), services, order, networks, volumes, discovered: BTreeMap::new() })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, GraphError> {
        let file: GraphFile = serde_yaml::from_str(yaml).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::new(file.name, file.services, file.networks, file.volumes)
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> { self.services.get(name) }

    pub fn contains(&self, name: &str) -> bool { self.services.contains_key(name) }

    pub fn len(&self) -> usize { self.services.len() }

    pub fn is_empty(&self) -> bool { self.services.is_empty() }

    /// Declared service names, dependencies first.
    pub fn order(&self) -> &[String] { &self.order }

    /// Declared services, dependencies first.
    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> + '_ {
        self.order.iter().filter_map(move |n| self.services.get(n))
    }

    pub fn networks(&self) -> &[String] { &self.networks }

    pub fn volumes(&self) -> &[String] { &self.volumes }

    /// Distinct images referenced by declared services, in dependency order.
    pub fn images(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.services().filter(|s| seen.insert(s.image.clone())).map(|s| s.image.clone()).collect()
    }

    /// Merge a pre-existing user service. Returns false when the name is
    /// already declared; declared services always win.
    pub fn merge_discovered(&mut self, service: DiscoveredService) -> bool {
        if self.services.contains_key(&service.name) {
            return false;
        }
        self.discovered.insert(service.name.clone(), service);
        true
    }

    pub fn discovered(&self) -> impl Iterator<Item = &DiscoveredService> + '_ { self.discovered.values() }

    /// Declared services in dependency order, then discovered ones by name.
    pub fn entries(&self) -> Vec<GraphEntry> {
        self.services()
            .cloned()
            .map(GraphEntry::Declared)
            .chain(self.discovered.values().cloned().map(GraphEntry::Discovered))
            .collect()
    }
}

/// Kahn's algorithm over dependency edges. Leftover nodes all sit on or
/// behind a cycle; one cycle is extracted for the error message.
fn topo_order(declared: &[String], services: &BTreeMap<String, ServiceSpec>) -> Result<Vec<String>, GraphError> {
    let mut pending: HashMap<&str, usize> = HashMap::with_capacity(declared.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in declared {
        let deps: HashSet<&str> = services[name].dependencies.iter().map(String::as_str).collect();
        pending.insert(name.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = declared.iter().map(String::as_str).filter(|n| pending[n] == 0).collect();
    let mut order = Vec::with_capacity(declared.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(ds) = dependents.get(name) {
            for d in ds {
                if let Some(n) = pending.get_mut(d) {
                    *n -= 1;
                    if *n == 0 { queue.push_back(*d); }
                }
            }
        }
    }

    if order.len() == declared.len() {
        return Ok(order);
    }
    let done: HashSet<&str> = order.iter().map(String::as_str).collect();
    let remaining: Vec<&str> = declared.iter().map(String::as_str).filter(|n| !done.contains(n)).collect();
    Err(GraphError::CyclicDependency { cycle: find_cycle(&remaining, services) })
}

fn find_cycle(remaining: &[&str], services: &BTreeMap<String, ServiceSpec>) -> Vec<String> {
    let left: HashSet<&str> = remaining.iter().copied().collect();
    let mut path: Vec<&str> = Vec::new();
    let mut cur = match remaining.first() { Some(c) => *c, None => return Vec::new() };
    loop {
        if let Some(pos) = path.iter().position(|p| *p == cur) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(cur.to_string());
            return cycle;
        }
        path.push(cur);
        // Every leftover node still waits on at least one leftover dependency.
        match services[cur].dependencies.iter().find(|d| left.contains(d.as_str())) {
            Some(next) => cur = next.as_str(),
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}
