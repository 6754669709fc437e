//! Dependency graph — builds nodes, rejects cycles, and groups checks
//! into execution waves.

use std::collections::{HashMap, HashSet};

use visor_domain::config::{CheckSpec, VisorConfig};
use visor_domain::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub depends_on: Vec<String>,
    pub dependents: Vec<String>,
    /// Longest path from a root; equals the wave index.
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    waves: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph over `selected` check ids.
    ///
    /// Fails with `Error::Config` on unknown dependencies or cycles.
    pub fn build(config: &VisorConfig, selected: &HashSet<String>) -> Result<Self> {
        let mut nodes: HashMap<String, Node> = HashMap::new();

        for id in selected {
            let spec = config
                .checks
                .get(id)
                .ok_or_else(|| Error::Config(format!("unknown check: {id}")))?;
            for dep in &spec.depends_on {
                if !config.checks.contains_key(dep) {
                    return Err(Error::Config(format!(
                        "check {id} depends on unknown check: {dep}"
                    )));
                }
            }
            let deps: Vec<String> = spec
                .depends_on
                .iter()
                .filter(|d| selected.contains(*d))
                .cloned()
                .collect();
            nodes.insert(
                id.clone(),
                Node {
                    id: id.clone(),
                    depends_on: deps,
                    dependents: Vec::new(),
                    depth: 0,
                },
            );
        }

        // Reverse edges.
        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|n| n.depends_on.iter().map(|d| (d.clone(), n.id.clone())))
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.push(dependent);
            }
        }
        for node in nodes.values_mut() {
            node.dependents.sort();
        }

        detect_cycles(&nodes)?;

        let waves = plan_waves(&mut nodes)?;

        Ok(Self { nodes, waves })
    }

    /// Execution groups in dependency order; checks within a wave have
    /// all dependencies satisfied by earlier waves.
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Direct dependents only (never transitive).
    pub fn direct_dependents(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn direct_dependencies(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// All transitive upstream checks of `id`.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = self
            .direct_dependencies(id)
            .iter()
            .map(String::as_str)
            .collect();
        while let Some(current) = stack.pop() {
            if out.insert(current.to_string()) {
                stack.extend(self.direct_dependencies(current).iter().map(String::as_str));
            }
        }
        out
    }

    /// True when `candidate` is a transitive dependent of `id`.
    pub fn is_downstream_of(&self, candidate: &str, id: &str) -> bool {
        self.ancestors(candidate).contains(id)
    }
}

/// DFS with a recursion stack; reports the ids participating in a cycle.
fn detect_cycles(nodes: &HashMap<String, Node>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    fn visit(
        id: &str,
        nodes: &HashMap<String, Node>,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        marks.insert(id.to_string(), Mark::InStack);
        stack.push(id.to_string());
        if let Some(node) = nodes.get(id) {
            for dep in &node.depends_on {
                match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::InStack => {
                        let start = stack.iter().position(|s| s == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..].to_vec();
                        cycle.push(dep.clone());
                        return Err(Error::Config(format!(
                            "dependency cycle: {}",
                            cycle.join(" -> ")
                        )));
                    }
                    Mark::Unvisited => visit(dep, nodes, marks, stack)?,
                    Mark::Done => {}
                }
            }
        }
        stack.pop();
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut ids: Vec<&String> = nodes.keys().collect();
    ids.sort();
    for id in ids {
        if marks.get(id.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
            visit(id, nodes, &mut marks, &mut Vec::new())?;
        }
    }
    Ok(())
}

/// Kahn-style leveling. Every wave is the set of nodes whose remaining
/// in-degree is zero; an empty wave on a non-empty remainder means the
/// cycle check missed something, which is a bug.
fn plan_waves(nodes: &mut HashMap<String, Node>) -> Result<Vec<Vec<String>>> {
    let mut remaining: HashSet<String> = nodes.keys().cloned().collect();
    let mut satisfied: HashSet<String> = HashSet::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let mut wave: Vec<String> = remaining
            .iter()
            .filter(|id| {
                nodes[*id]
                    .depends_on
                    .iter()
                    .all(|dep| satisfied.contains(dep))
            })
            .cloned()
            .collect();
        if wave.is_empty() {
            return Err(Error::Internal(
                "empty execution wave on acyclic graph".into(),
            ));
        }
        wave.sort();
        for id in &wave {
            remaining.remove(id);
            satisfied.insert(id.clone());
            if let Some(node) = nodes.get_mut(id) {
                node.depth = waves.len();
            }
        }
        waves.push(wave);
    }

    Ok(waves)
}

/// Compute the selected check set for an event: explicitly requested
/// checks (or all event-matching ones), tag-filtered, closed over
/// transitive dependencies.
pub fn select_checks(
    config: &VisorConfig,
    requested: &[String],
    tags: &[String],
    event: visor_domain::event::TriggerEvent,
) -> Result<HashSet<String>> {
    let mut selected: HashSet<String> = HashSet::new();

    if requested.is_empty() {
        for (id, spec) in &config.checks {
            if spec.runs_on(event) && matches_tags(spec, tags) {
                selected.insert(id.clone());
            }
        }
    } else {
        for id in requested {
            if !config.checks.contains_key(id) {
                return Err(Error::Config(format!("unknown check: {id}")));
            }
            selected.insert(id.clone());
        }
        if !tags.is_empty() {
            selected.retain(|id| matches_tags(&config.checks[id], tags));
        }
    }

    // Close over dependencies so selected checks can read their inputs.
    let mut stack: Vec<String> = selected.iter().cloned().collect();
    while let Some(id) = stack.pop() {
        let Some(spec) = config.checks.get(&id) else {
            continue;
        };
        for dep in &spec.depends_on {
            if config.checks.contains_key(dep) && selected.insert(dep.clone()) {
                stack.push(dep.clone());
            }
        }
    }

    Ok(selected)
}

fn matches_tags(spec: &CheckSpec, tags: &[String]) -> bool {
    tags.is_empty() || tags.iter().any(|t| spec.has_tag(t))
}
